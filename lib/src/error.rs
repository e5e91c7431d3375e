//! The error taxonomy driving rollback/propagation decisions in the
//! orchestrator. Call sites that only need to bubble a failure up to the CLI
//! use `anyhow::Result`; call sites that need to match on error *kind*
//! (rollback logic, tests) use `Result<T, ChariotError>`.

use crate::tag::Tag;

/// A unit or graph-construction failure, tagged with the kind the rest of
/// the system branches on.
#[derive(thiserror::Error, Debug)]
pub enum ChariotError {
    #[error("parsing manifest: {0}")]
    ManifestParse(#[from] toml::de::Error),

    #[error("manifest schema error: {0}")]
    ManifestSchema(String),

    #[error("{tag} is not declared in the manifest")]
    UndefinedTarget { tag: Tag },

    #[error("dependency cycle detected at {tag}")]
    CycleDetected { tag: Tag },

    #[error("fetching {tag} failed: {reason}")]
    FetchFailed { tag: Tag, reason: String },

    #[error("modifier on {tag} failed: {reason}")]
    ModifierFailed { tag: Tag, reason: String },

    #[error("sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error("build command for {tag} failed: {reason}")]
    BuildCommand { tag: Tag, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ChariotError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChariotError>;
