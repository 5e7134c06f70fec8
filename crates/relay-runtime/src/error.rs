/// Error kinds surfaced by the service runtime.
///
/// Admin surfaces map these onto HTTP status codes; everything that is not a
/// lifecycle error travels through `Other` with its context preserved.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("Service {0} not found")]
    NotFound(i64),

    #[error("Service {0} already exists")]
    AlreadyExists(i64),

    #[error("Service '{name}' failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Service '{name}' failed to stop: {source}")]
    StopFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Service {0} is not registered with the health checker")]
    NotRegistered(i64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::ServiceError;

    #[test]
    fn display_not_found() {
        assert_eq!(
            ServiceError::NotFound(42).to_string(),
            "Service 42 not found"
        );
    }

    #[test]
    fn display_already_exists() {
        assert_eq!(
            ServiceError::AlreadyExists(7).to_string(),
            "Service 7 already exists"
        );
    }

    #[test]
    fn display_start_failed_includes_cause() {
        let err = ServiceError::StartFailed {
            name: "search".to_string(),
            source: anyhow::anyhow!("connection refused"),
        };
        assert_eq!(
            err.to_string(),
            "Service 'search' failed to start: connection refused"
        );
    }

    #[test]
    fn display_not_registered() {
        assert_eq!(
            ServiceError::NotRegistered(3).to_string(),
            "Service 3 is not registered with the health checker"
        );
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServiceError>();
    }
}
