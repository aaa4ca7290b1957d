use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid content hash: {0:?}")]
    InvalidHash(String),

    #[error("Invalid measure size: {0}")]
    InvalidMeasureTier(u32),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Unexpected status {status} from {target}")]
    Protocol { status: StatusCode, target: String },

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Process exit code used when this error aborts startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            StorageError::Config(_) => 1,
            _ => 2,
        }
    }

    /// Status a front-end should answer with when a request fails with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::InvalidHash(_) | StorageError::InvalidMeasureTier(_) => {
                StatusCode::BAD_REQUEST
            }
            StorageError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            StorageError::Protocol { status, .. } => *status,
            StorageError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::Http(_) | StorageError::ObjectStore(_) => StatusCode::BAD_GATEWAY,
            StorageError::Config(_) | StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: StorageError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());

        let err: StorageError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(StorageError::Config("alias".into()).exit_code(), 1);
        assert_eq!(StorageError::Cancelled.exit_code(), 2);
    }

    #[test]
    fn test_protocol_error_keeps_remote_status() {
        let err = StorageError::Protocol {
            status: StatusCode::FORBIDDEN,
            target: "http://dav/download/ab/abcd".into(),
        };
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("403"));
    }
}
