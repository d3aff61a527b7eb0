//! Error taxonomy shared by every component.

use serde::Serialize;

use super::model::ServiceFailure;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable classification of an [`Error`], exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    MalformedManifest,
    NotFound,
    DuplicateName,
    MissingId,
    InvalidName,
    ProjectBusy,
    NoProxyConfigured,
    NoMirrorConfigured,
    RuntimeUnavailable,
    RuntimeFailure,
    Timeout,
    PartialFailure,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input is structurally invalid. `field` points at the offending entry.
    #[error("malformed manifest at {field}: {detail}")]
    MalformedManifest { field: String, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("project name {0} is already in use")]
    DuplicateName(String),

    #[error("template id is required")]
    MissingId,

    #[error("invalid name {name:?}: {detail}")]
    InvalidName { name: String, detail: String },

    #[error("project {0} already has an operation in flight")]
    ProjectBusy(String),

    #[error("pull requires a proxy but none is configured")]
    NoProxyConfigured,

    #[error("pull requires a registry mirror but none is configured")]
    NoMirrorConfigured,

    /// Control plane could not be reached. Callers may retry.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Control plane answered with a failure.
    #[error("container runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("partial failure: {detail}")]
    PartialFailure {
        detail: String,
        failures: Vec<ServiceFailure>,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn malformed(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedManifest {
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn storage(detail: impl Into<String>) -> Self {
        Self::Storage(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedManifest { .. } => ErrorKind::MalformedManifest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateName(_) => ErrorKind::DuplicateName,
            Self::MissingId => ErrorKind::MissingId,
            Self::InvalidName { .. } => ErrorKind::InvalidName,
            Self::ProjectBusy(_) => ErrorKind::ProjectBusy,
            Self::NoProxyConfigured => ErrorKind::NoProxyConfigured,
            Self::NoMirrorConfigured => ErrorKind::NoMirrorConfigured,
            Self::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            Self::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only an unreachable control plane is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable(_))
    }
}

/// Checks the naming rule shared by template ids and project names.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |detail: &str| Error::InvalidName {
        name: name.to_string(),
        detail: detail.to_string(),
    };
    let first = name.chars().next().ok_or_else(|| invalid("must not be empty"))?;
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return Err(invalid("must start with a lowercase letter or a digit"));
    }
    if name.len() > 64 {
        return Err(invalid("must be at most 64 characters"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return Err(invalid(&format!("unexpected character {c:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_compose_project_rules() {
        assert!(validate_name("site1").is_ok());
        assert!(validate_name("my_app-2").is_ok());
        assert!(matches!(validate_name(""), Err(Error::InvalidName { .. })));
        assert!(matches!(validate_name("-x"), Err(Error::InvalidName { .. })));
        assert!(matches!(validate_name("Web"), Err(Error::InvalidName { .. })));
        assert!(matches!(validate_name("../etc"), Err(Error::InvalidName { .. })));
    }

    #[test]
    fn only_unavailable_runtime_is_transient() {
        assert!(Error::RuntimeUnavailable("socket".into()).is_transient());
        assert!(!Error::RuntimeFailure("500".into()).is_transient());
        assert!(!Error::Timeout("pull".into()).is_transient());
    }
}
