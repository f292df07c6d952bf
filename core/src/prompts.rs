//! Versioned prompt templates loaded from `<prompts_dir>/<operation>/<version>.yaml`.
//!
//! Each file carries a `system` and a `user` portion. `latest.yaml` may either
//! be a full template or an `alias: vX.Y` pointer to another version. When the
//! latest template cannot be used the manager falls back to [`PINNED_VERSION`].
//!
//! Placeholders are written `{name}` and must belong to the operation's known
//! variable set; `{{` and `}}` render as literal braces.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LATEST: &str = "latest";
pub const PINNED_VERSION: &str = "v1.0";
const EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptOperation {
    CharterValidation,
    SuggestionGeneration,
    SuggestionApplication,
    ReleaseExtraction,
}

impl PromptOperation {
    pub const ALL: [PromptOperation; 4] = [
        Self::CharterValidation,
        Self::SuggestionGeneration,
        Self::SuggestionApplication,
        Self::ReleaseExtraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CharterValidation => "charter_validation",
            Self::SuggestionGeneration => "suggestion_generation",
            Self::SuggestionApplication => "suggestion_application",
            Self::ReleaseExtraction => "release_extraction",
        }
    }

    /// Placeholders a template for this operation may use.
    pub fn variables(&self) -> &'static [&'static str] {
        match self {
            Self::CharterValidation => &["charter_text", "expected_format"],
            Self::SuggestionGeneration => &["charter", "existing_issues"],
            Self::SuggestionApplication => &["charter", "suggestions"],
            Self::ReleaseExtraction => &["charter_data"],
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template {operation}/{version} not found")]
    NotFound {
        operation: &'static str,
        version: String,
    },
    #[error("failed to read prompt template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse prompt template {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("prompt template {operation}/{version} has no {portion} portion")]
    MissingPortion {
        operation: &'static str,
        version: String,
        portion: &'static str,
    },
    #[error("prompt template {operation}/{version} uses unknown placeholder {{{name}}}")]
    UnknownPlaceholder {
        operation: &'static str,
        version: String,
        name: String,
    },
    #[error("prompt template {operation}/{version} aliases {target}, which is itself an alias")]
    AliasChain {
        operation: &'static str,
        version: String,
        target: String,
    },
    #[error("no value supplied for placeholder {{{name}}} in {operation}/{version}")]
    UnresolvedPlaceholder {
        operation: &'static str,
        version: String,
        name: String,
    },
}

impl PromptError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "PRM-1001",
            Self::Io { .. } => "PRM-1002",
            Self::Yaml { .. } => "PRM-1003",
            Self::MissingPortion { .. } | Self::AliasChain { .. } => "PRM-1004",
            Self::UnknownPlaceholder { .. } => "PRM-1005",
            Self::UnresolvedPlaceholder { .. } => "PRM-1006",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TemplateFile {
    system: Option<String>,
    user: Option<String>,
    alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub operation: PromptOperation,
    /// Concrete version the portions were loaded from, never `latest`.
    pub version: String,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedPrompt {
    pub operation: PromptOperation,
    pub version: String,
    pub system: String,
    pub user: String,
}

pub struct PromptManager {
    root: PathBuf,
    cache: Mutex<HashMap<(PromptOperation, String), Arc<PromptTemplate>>>,
}

impl PromptManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The template to use for `operation`: latest if usable, the pinned version otherwise.
    pub fn resolve(&self, operation: PromptOperation) -> Result<Arc<PromptTemplate>, PromptError> {
        match self.load(operation, LATEST) {
            Ok(template) => Ok(template),
            Err(err) => {
                log::warn!(
                    "prompt {}/{LATEST} unusable, falling back to {PINNED_VERSION}: {err}",
                    operation.as_str()
                );
                self.load(operation, PINNED_VERSION)
            }
        }
    }

    /// Resolve and substitute in one step.
    pub fn render(
        &self,
        operation: PromptOperation,
        vars: &HashMap<&str, String>,
    ) -> Result<RenderedPrompt, PromptError> {
        let template = self.resolve(operation)?;
        template.render(vars)
    }

    /// Load an explicit version, following one alias hop.
    pub fn load(
        &self,
        operation: PromptOperation,
        version: &str,
    ) -> Result<Arc<PromptTemplate>, PromptError> {
        let key = (operation, version.to_string());
        if let Some(hit) = self.lock_cache().get(&key) {
            return Ok(hit.clone());
        }

        let file = self.read_file(operation, version)?;
        let template = match file.alias {
            Some(target) => {
                let target = target.trim().to_string();
                let aliased = self.read_file(operation, &target)?;
                if aliased.alias.is_some() {
                    return Err(PromptError::AliasChain {
                        operation: operation.as_str(),
                        version: version.to_string(),
                        target,
                    });
                }
                build_template(operation, &target, aliased)?
            }
            None => build_template(operation, version, file)?,
        };

        let template = Arc::new(template);
        self.lock_cache().insert(key, template.clone());
        Ok(template)
    }

    /// Versions available for an operation, `latest` first then newest first.
    pub fn list_versions(&self, operation: PromptOperation) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.root.join(operation.as_str())) else {
            return Vec::new();
        };
        let mut versions: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| EXTENSIONS.contains(&e))
            })
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        versions.sort_by(|a, b| version_rank(b).cmp(&version_rank(a)));
        versions.dedup();
        versions
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<(PromptOperation, String), Arc<PromptTemplate>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_file(&self, operation: PromptOperation, version: &str) -> Result<TemplateFile, PromptError> {
        let dir = self.root.join(operation.as_str());
        let path = EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{version}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| PromptError::NotFound {
                operation: operation.as_str(),
                version: version.to_string(),
            })?;
        let raw = fs::read_to_string(&path).map_err(|source| PromptError::Io {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| PromptError::Yaml { path, source })
    }
}

/// `latest` sorts above every numbered version; `v1.10` above `v1.9`.
fn version_rank(version: &str) -> (u8, Vec<u64>, String) {
    if version == LATEST {
        return (2, Vec::new(), String::new());
    }
    let numbers: Option<Vec<u64>> = version
        .trim_start_matches('v')
        .split('.')
        .map(|part| part.parse().ok())
        .collect();
    match numbers {
        Some(parts) => (1, parts, String::new()),
        None => (0, Vec::new(), version.to_string()),
    }
}

fn build_template(
    operation: PromptOperation,
    version: &str,
    file: TemplateFile,
) -> Result<PromptTemplate, PromptError> {
    let portion = |value: Option<String>, name: &'static str| {
        value
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| PromptError::MissingPortion {
                operation: operation.as_str(),
                version: version.to_string(),
                portion: name,
            })
    };
    let system = portion(file.system, "system")?;
    let user = portion(file.user, "user")?;

    let allowed = operation.variables();
    for text in [&system, &user] {
        for segment in segments(text) {
            if let Segment::Placeholder(name) = segment {
                if !allowed.contains(&name) {
                    return Err(PromptError::UnknownPlaceholder {
                        operation: operation.as_str(),
                        version: version.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }
    }

    Ok(PromptTemplate {
        operation,
        version: version.to_string(),
        system,
        user,
    })
}

impl PromptTemplate {
    pub fn render(&self, vars: &HashMap<&str, String>) -> Result<RenderedPrompt, PromptError> {
        Ok(RenderedPrompt {
            operation: self.operation,
            version: self.version.clone(),
            system: self.substitute(&self.system, vars)?,
            user: self.substitute(&self.user, vars)?,
        })
    }

    fn substitute(&self, text: &str, vars: &HashMap<&str, String>) -> Result<String, PromptError> {
        let mut out = String::with_capacity(text.len());
        for segment in segments(text) {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Placeholder(name) => {
                    let value = vars.get(name).ok_or_else(|| PromptError::UnresolvedPlaceholder {
                        operation: self.operation.as_str(),
                        version: self.version.clone(),
                        name: name.to_string(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Splits template text into literal runs and `{ident}` placeholders.
/// Doubled braces collapse to one literal brace; any other brace is literal.
fn segments(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'}' if bytes.get(i + 1) == Some(&bytes[i]) => {
                if start < i {
                    out.push(Segment::Literal(&text[start..i]));
                }
                out.push(Segment::Literal(&text[i..i + 1]));
                i += 2;
                start = i;
            }
            b'{' => match placeholder_end(bytes, i + 1) {
                Some(end) => {
                    if start < i {
                        out.push(Segment::Literal(&text[start..i]));
                    }
                    out.push(Segment::Placeholder(&text[i + 1..end]));
                    i = end + 1;
                    start = i;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        out.push(Segment::Literal(&text[start..]));
    }
    out
}

/// Index of the closing brace when `bytes[from..]` starts with `ident}`.
fn placeholder_end(bytes: &[u8], from: usize) -> Option<usize> {
    let first = *bytes.get(from)?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let mut j = from + 1;
    while let Some(&b) = bytes.get(j) {
        if b == b'}' {
            return Some(j);
        }
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        j += 1;
    }
    None
}
