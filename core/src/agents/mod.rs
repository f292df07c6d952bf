pub mod orchestrator;
pub mod providers;

pub use orchestrator::{
    AiProvider, Backend, Completion, CompletionOptions, ProviderError, UsageMetrics,
};
pub use providers::ProviderKind;
