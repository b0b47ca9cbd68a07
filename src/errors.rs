//! Structured error types for every fallible boundary in the engine.
//!
//! Catalog-load errors carry `miette` source spans so a reload failure can
//! point at the exact document and location that's wrong; everything else
//! is a plain `thiserror` enum consumed by the transport collaborator.

use std::path::PathBuf;

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// Failure loading or validating a rule catalog. Never raised during
/// classification -- only from [`crate::catalog::CatalogStore::reload`].
#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("catalog path does not exist: {0}")]
    FileMissing(PathBuf),

    #[error("failed to parse {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: ParseErrorKind,
    },

    #[error("catalog schema violation(s)")]
    SchemaViolation { violations: Vec<SchemaViolation> },

    #[error("catalog semantic error(s)")]
    SemanticError { errors: Vec<SemanticError> },
}

#[derive(Debug, Error)]
pub enum ParseErrorKind {
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unrecognized catalog file extension")]
    UnknownExtension,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One schema-level violation found while validating a catalog document.
#[derive(Debug, Error, Diagnostic, Clone)]
#[error("{reason}")]
pub struct SchemaViolation {
    pub path: PathBuf,
    pub reason: String,
    #[source_code]
    pub source_code: String,
    #[label("here")]
    pub span: Option<SourceSpan>,
}

/// One semantic-level error (references that don't resolve, cycles, etc.)
#[derive(Debug, Error, Clone)]
#[error("{kind}: {detail}")]
pub struct SemanticError {
    pub kind: String,
    pub detail: String,
}

/// Failure parsing a raw input payload before any classification runs.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("FHIR resource missing required field {0}")]
    MissingField(&'static str),

    #[error("HL7 v2 message is missing an MSH segment")]
    MissingMsh,

    #[error("HL7 v2 segment delimiters could not be determined from MSH-1/MSH-2")]
    BadDelimiters,

    #[error("HL7 v2 segment is malformed: {0}")]
    MalformedSegment(String),
}

/// Raised by format auto-detection when the payload matches none of the
/// known shapes.
#[derive(Debug, Error)]
#[error("could not determine input format from payload")]
pub struct UnsupportedFormat;

/// The terminology oracle collaborator failed or timed out. Never fatal --
/// callers degrade to offline normalization and treat the organism or
/// antibiotic as `Unresolved`.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle call timed out")]
    Timeout,
    #[error("oracle transport error: {0}")]
    Transport(String),
    #[error("oracle returned an unparseable response: {0}")]
    BadResponse(String),
}

/// An internal consistency failure during rule evaluation (e.g. a rule
/// references a class that no longer exists). Should be unreachable if the
/// catalog store's validation contract held; surfaced as 5xx by transport,
/// with the offending input degraded to `REQUIRES_REVIEW`.
#[derive(Debug, Error)]
#[error("internal rule evaluation error [{error_id}]: {detail}")]
pub struct RuleEvaluationError {
    pub error_id: String,
    pub detail: String,
}
