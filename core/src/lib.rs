//! Core library for the PlanFlow planning backend.
//!
//! - [`models`] holds the Project → Release → Epic → UserStory → UseCase / TestCase
//!   records and their SQLite repositories.
//! - [`agents`] talks to the OpenAI and Anthropic completion APIs.
//! - [`prompts`] loads versioned prompt templates from disk.
//! - [`parser`] pulls JSON out of model replies and falls back to defaults.
//! - [`model_manager`] ties prompts and providers together and logs each call.
//! - [`charter`] and [`release_planner`] are the AI-assisted planning services.
//! - [`api`] exposes everything over HTTP with axum.
//! - [`workers`] runs queued AI jobs in the background.
//! - [`config`], [`db`], [`errors`] and [`logging`] are the shared plumbing.

pub mod agents;
pub mod api;
pub mod charter;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod model_manager;
pub mod models;
pub mod parser;
pub mod prompts;
pub mod release_planner;
pub mod workers;
