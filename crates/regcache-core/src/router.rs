//! Host → upstream base URL routing.
//!
//! The route table is built once at startup from a custom domain and a
//! fixed label set, and never reloaded — there is no admin surface that
//! would need a live `reload()`.

use std::collections::HashMap;

/// Fixed labels the proxy mounts under `<label>.<custom-domain>`.
pub const LABELS: &[(&str, &str)] = &[
    ("docker", "https://registry-1.docker.io"),
    ("quay", "https://quay.io"),
    ("gcr", "https://gcr.io"),
    ("k8s-gcr", "https://k8s.gcr.io"),
    ("k8s", "https://registry.k8s.io"),
    ("ghcr", "https://ghcr.io"),
    ("cloudsmith", "https://docker.cloudsmith.io"),
    ("ecr", "https://public.ecr.aws"),
    // docker-staging is an alias of Docker Hub.
    ("docker-staging", "https://registry-1.docker.io"),
];

pub struct Router {
    routes: HashMap<String, String>,
    debug_fallback: Option<String>,
}

impl Router {
    pub fn new(custom_domain: &str, debug_fallback: Option<String>) -> Self {
        let mut routes = HashMap::new();
        for (label, upstream) in LABELS {
            routes.insert(format!("{label}.{custom_domain}"), upstream.to_string());
        }
        Self { routes, debug_fallback }
    }

    /// Given an inbound `Host` header with any `:port` suffix already stripped.
    pub fn resolve(&self, host: &str) -> Option<&str> {
        self.routes.get(host).map(String::as_str).or(self.debug_fallback.as_deref())
    }

    pub fn is_docker_hub(upstream: &str) -> bool {
        upstream.contains("registry-1.docker.io")
    }

    pub fn routes(&self) -> &HashMap<String, String> {
        &self.routes
    }
}

/// Strips an optional `:port` suffix from a `Host` header value.
pub fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_label() {
        let router = Router::new("example.com", None);
        assert_eq!(router.resolve("docker.example.com"), Some("https://registry-1.docker.io"));
    }

    #[test]
    fn unknown_host_falls_back_to_debug_upstream() {
        let router = Router::new("example.com", Some("https://fallback.test".to_string()));
        assert_eq!(router.resolve("nope.example.com"), Some("https://fallback.test"));
    }

    #[test]
    fn unknown_host_without_fallback_is_empty() {
        let router = Router::new("example.com", None);
        assert_eq!(router.resolve("nope.example.com"), None);
    }

    #[test]
    fn strip_port_removes_suffix() {
        assert_eq!(strip_port("docker.example.com:8080"), "docker.example.com");
        assert_eq!(strip_port("docker.example.com"), "docker.example.com");
    }

    #[test]
    fn docker_staging_aliases_docker_hub() {
        let router = Router::new("example.com", None);
        assert_eq!(router.resolve("docker-staging.example.com"), router.resolve("docker.example.com"));
    }
}
