//! Unified error handling for the conquest engine.
//!
//! Only [`ConquestError::Unauthenticated`] and [`ConquestError::InvalidQuery`]
//! ever escape the public query operations. Every other variant is produced at
//! an I/O or geometry boundary and consumed locally: the affected page, cell or
//! municipality is skipped and the response is simply less complete.

use serde_json::json;
use thiserror::Error;

/// Unified error type for conquest operations.
#[derive(Debug, Clone, Error)]
pub enum ConquestError {
    /// Activity provider or geocoder unreachable, timed out, or non-200
    #[error("{}", upstream_message(.message, .status_code))]
    UpstreamUnavailable {
        message: String,
        status_code: Option<u16>,
    },
    /// Upstream payload did not have the expected shape
    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },
    /// Boundary outline cannot be used for containment
    #[error("Geometry error for '{municipality}': {message}")]
    Geometry {
        municipality: String,
        message: String,
    },
    /// No credential in the request context
    #[error("Login required")]
    Unauthenticated,
    /// Query parameters out of range
    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },
    /// Boundary snapshot could not be read or written
    #[error("Persistence error: {message}")]
    Persistence { message: String },
}

fn upstream_message(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("Upstream unavailable ({}): {}", code, message),
        None => format!("Upstream unavailable: {}", message),
    }
}

impl ConquestError {
    pub(crate) fn upstream(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
            status_code,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    pub(crate) fn geometry(municipality: &str, message: impl Into<String>) -> Self {
        Self::Geometry {
            municipality: municipality.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ConquestError::Unauthenticated => 401,
            ConquestError::InvalidQuery { .. } => 400,
            _ => 500,
        }
    }

    /// JSON body a transport layer should answer with.
    pub fn error_payload(&self) -> serde_json::Value {
        json!({ "error": self.to_string() })
    }
}

/// Result type alias for conquest operations.
pub type Result<T> = std::result::Result<T, ConquestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConquestError::upstream("HTTP 404 Not Found", Some(404));
        assert!(err.to_string().contains("404"));

        let err = ConquestError::upstream("connection refused", None);
        assert_eq!(err.to_string(), "Upstream unavailable: connection refused");

        let err = ConquestError::geometry("Lyon", "outline has 2 vertices");
        assert!(err.to_string().contains("Lyon"));
    }

    #[test]
    fn test_unauthenticated_payload() {
        let err = ConquestError::Unauthenticated;
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.error_payload(), json!({ "error": "Login required" }));
    }

    #[test]
    fn test_status_codes() {
        let invalid = ConquestError::InvalidQuery {
            message: "grid size must be positive".to_string(),
        };
        assert_eq!(invalid.status_code(), 400);
        assert_eq!(ConquestError::malformed("bad json").status_code(), 500);
    }
}
