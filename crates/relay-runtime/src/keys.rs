//! Canonical cache keys for everything keyed on a service id.
//!
//! Pure functions so every component derives the same key for the same
//! service without sharing state.

/// Key of the shared upstream instance for a service.
pub fn shared_service_cache_key(service_id: i64) -> String {
    format!("global-service-{service_id}-shared")
}

/// Instance-name detail embedded in the upstream client info for logging.
pub fn shared_service_instance_name(service_id: i64) -> String {
    format!("global-shared-svc-{service_id}")
}

/// Key of the cached SSE handler for a service.
pub fn sse_handler_key(service_id: i64) -> String {
    format!("service-{service_id}-sseproxy")
}

/// Key of the cached streamable-HTTP handler for a service.
pub fn http_handler_key(service_id: i64) -> String {
    format!("service-{service_id}-httpproxy")
}

/// Key of the tools-list cache entry for a service.
pub fn tools_cache_key(service_id: i64) -> String {
    format!("tools:service:{service_id}")
}

/// Key of the health-status cache entry for a service.
pub fn health_cache_key(service_id: i64) -> String {
    format!("health:service:{service_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable() {
        assert_eq!(shared_service_cache_key(12), "global-service-12-shared");
        assert_eq!(shared_service_instance_name(12), "global-shared-svc-12");
        assert_eq!(sse_handler_key(12), "service-12-sseproxy");
        assert_eq!(http_handler_key(12), "service-12-httpproxy");
        assert_eq!(tools_cache_key(12), "tools:service:12");
        assert_eq!(health_cache_key(12), "health:service:12");
    }

    #[test]
    fn keys_embed_negative_ids_verbatim() {
        assert_eq!(shared_service_cache_key(-1), "global-service--1-shared");
        assert_eq!(tools_cache_key(-1), "tools:service:-1");
    }
}
