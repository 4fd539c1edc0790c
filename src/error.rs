//! Error taxonomy shared by every library module.
//!
//! Query-time code inspects [`Error::ExternalService`] to decide whether a
//! failed backend can be dropped from a hybrid search; ingestion code simply
//! propagates it. Cleanup paths log and swallow.

use std::fmt;
use std::time::Duration;

/// The collaborator that failed in an [`Error::ExternalService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Embedding,
    VectorIndex,
    KeywordIndex,
    BlobStore,
    Extraction,
    Storage,
    Queue,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Embedding => "embedding service",
            Service::VectorIndex => "vector index",
            Service::KeywordIndex => "keyword index",
            Service::BlobStore => "blob store",
            Service::Extraction => "page extractor",
            Service::Storage => "document store",
            Service::Queue => "processing queue",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input. Surfaced immediately, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{service} failed: {message}")]
    ExternalService { service: Service, message: String },

    /// Stored data violates an invariant (e.g. a cycle in the version tree).
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn external(service: Service, err: impl fmt::Display) -> Self {
        Error::ExternalService {
            service,
            message: err.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// The failing collaborator, if this is an external-service error.
    pub fn service(&self) -> Option<Service> {
        match self {
            Error::ExternalService { service, .. } => Some(*service),
            _ => None,
        }
    }
}

/// Tag a foreign error with the collaborator it came from.
pub trait ServiceResultExt<T> {
    fn service_err(self, service: Service) -> Result<T>;
}

impl<T, E: fmt::Display> ServiceResultExt<T> for std::result::Result<T, E> {
    fn service_err(self, service: Service) -> Result<T> {
        self.map_err(|e| Error::external(service, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_message_names_service() {
        let err = Error::external(Service::VectorIndex, "connection refused");
        assert_eq!(err.to_string(), "vector index failed: connection refused");
        assert_eq!(err.service(), Some(Service::VectorIndex));
    }

    #[test]
    fn test_service_err_wraps_foreign_error() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing blob",
        ));
        let err = res.service_err(Service::BlobStore).unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalService {
                service: Service::BlobStore,
                ..
            }
        ));
    }

    #[test]
    fn test_not_found_helper() {
        let err = Error::not_found("document", "doc-1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "document not found: doc-1");
    }
}
