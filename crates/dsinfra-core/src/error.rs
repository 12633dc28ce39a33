use crate::types::CloudName;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ConfigIssue / ConfigError
// ---------------------------------------------------------------------------

/// A single validation finding, addressed by the dotted path of the
/// offending field (e.g. `datasets.fewgenomes.depends_on[0]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every problem found in one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} configuration issue(s): {}", .issues.len(), render_issues(.issues))]
pub struct ConfigError {
    pub issues: Vec<ConfigIssue>,
}

impl ConfigError {
    pub fn mentions(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

fn render_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// InfraError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum InfraError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("{cloud} does not support {capability}")]
    UnsupportedCapability {
        cloud: CloudName,
        capability: &'static str,
    },

    #[error("failed to provision '{resource_key}': {message}")]
    Provisioning {
        resource_key: String,
        message: String,
    },

    #[error("accessor cycle while building '{key}'")]
    AccessorCycle { key: String },

    #[error("group memberships are finalized, cannot modify '{group}'")]
    GroupsFinalized { group: String },

    #[error("group target '{target}' failed for '{group}': {message}")]
    FinalizeTarget {
        target: String,
        group: String,
        message: String,
    },

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("no identity configured for '{0}'")]
    MissingIdentity(String),

    #[error("plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid cloud '{0}': expected gcp or azure")]
    InvalidCloud(String),

    #[error("invalid access level: {0}")]
    InvalidAccessLevel(String),

    #[error("invalid group kind: {0}")]
    InvalidGroupKind(String),

    #[error("invalid component: {0}")]
    InvalidComponent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl InfraError {
    /// Rebuild an equivalent error so a cached failure can be handed to every
    /// later caller. Wrapped library errors are flattened to their message.
    pub fn replay(&self) -> Self {
        match self {
            Self::Config(e) => Self::Config(e.clone()),
            Self::DependencyCycle { cycle } => Self::DependencyCycle {
                cycle: cycle.clone(),
            },
            Self::UnsupportedCapability { cloud, capability } => Self::UnsupportedCapability {
                cloud: *cloud,
                capability: *capability,
            },
            Self::Provisioning {
                resource_key,
                message,
            } => Self::Provisioning {
                resource_key: resource_key.clone(),
                message: message.clone(),
            },
            Self::AccessorCycle { key } => Self::AccessorCycle { key: key.clone() },
            Self::GroupsFinalized { group } => Self::GroupsFinalized {
                group: group.clone(),
            },
            Self::FinalizeTarget {
                target,
                group,
                message,
            } => Self::FinalizeTarget {
                target: target.clone(),
                group: group.clone(),
                message: message.clone(),
            },
            Self::DatasetNotFound(s) => Self::DatasetNotFound(s.clone()),
            Self::MissingIdentity(s) => Self::MissingIdentity(s.clone()),
            Self::Plugin { plugin, message } => Self::Plugin {
                plugin: plugin.clone(),
                message: message.clone(),
            },
            Self::InvalidTransition { from, to } => Self::InvalidTransition {
                from: from.clone(),
                to: to.clone(),
            },
            Self::InvalidCloud(s) => Self::InvalidCloud(s.clone()),
            Self::InvalidAccessLevel(s) => Self::InvalidAccessLevel(s.clone()),
            Self::InvalidGroupKind(s) => Self::InvalidGroupKind(s.clone()),
            Self::InvalidComponent(s) => Self::InvalidComponent(s.clone()),
            other => Self::Provisioning {
                resource_key: String::new(),
                message: other.to_string(),
            },
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedCapability { .. })
    }
}

pub type Result<T> = std::result::Result<T, InfraError>;
