use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by catalog loading, parameter parsing, rendering and assembly.
/// They abort synthesis with no partial output; invariant violations go into a
/// `ValidationReport` instead.
#[derive(Debug, Error)]
pub enum SynthError {
    /// Bad network syntax in caller input
    #[error("malformed CIDR in {field}: {value:?} ({reason})")]
    MalformedCidr {
        field: String,
        value: String,
        reason: String,
    },

    /// A typed parameter field failed validation
    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    /// Catalog reference to a template or fragment that does not exist
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// A section name outside the template family's assembly order
    #[error("unknown section {section:?} referenced by {referenced_by}")]
    UnknownSection {
        section: String,
        referenced_by: String,
    },

    /// Placeholders with no matching value; lists every missing key
    #[error("unresolved placeholders: {}", keys.join(", "))]
    UnresolvedPlaceholder { keys: Vec<String> },

    /// Tera rejected a placeholder expression (e.g. an unknown filter)
    #[error("render failed in {location}: {message}")]
    Render { location: String, message: String },

    /// A template or fragment file could not be parsed
    #[error("{path}:{line}: {message}")]
    CatalogParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("catalog I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid parameter document: {0}")]
    Json(#[from] serde_json::Error),
}

impl SynthError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed_cidr(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedCidr {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Attach a field path to an error produced without one
    pub fn in_field(self, path: &str) -> Self {
        match self {
            Self::MalformedCidr { value, reason, .. } => Self::MalformedCidr {
                field: path.to_string(),
                value,
                reason,
            },
            Self::InvalidField { reason, .. } => Self::InvalidField {
                field: path.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// Result type for engine operations
pub type SynthResult<T> = Result<T, SynthError>;
