//! Redirect classifier: decides whether a 3xx from upstream should be
//! followed server-side or relayed verbatim to the client.

/// Default blocked-host substrings: known signed-URL / object-storage
/// backends that the proxy's clients typically cannot reach directly, or
/// whose signatures would be invalidated by a client-side re-request through
/// an intermediary. Operators append more via `BLOCKED_HOSTS`.
pub const DEFAULT_BLOCKED_HOSTS: &[&str] = &[
    "amazonaws.com",
    "s3.",
    "blob.core.windows.net",
    "storage.googleapis.com",
    "cloudflarestorage.com",
    "digitaloceanspaces.com",
];

pub struct RedirectClassifier {
    blocked_hosts: Vec<String>,
    follow_all: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RedirectDecision {
    FollowServerSide,
    RelayToClient,
}

impl RedirectClassifier {
    pub fn new(extra_blocked_hosts: Vec<String>, follow_all: bool) -> Self {
        let mut blocked_hosts: Vec<String> = DEFAULT_BLOCKED_HOSTS.iter().map(|s| s.to_string()).collect();
        blocked_hosts.extend(extra_blocked_hosts);
        Self { blocked_hosts, follow_all }
    }

    pub fn classify(&self, location: &str) -> RedirectDecision {
        if self.follow_all {
            return RedirectDecision::FollowServerSide;
        }
        let host = extract_host(location).unwrap_or_default();
        if self.blocked_hosts.iter().any(|pattern| host.contains(pattern.as_str())) {
            return RedirectDecision::FollowServerSide;
        }
        RedirectDecision::RelayToClient
    }
}

fn extract_host(location: &str) -> Option<String> {
    url::Url::parse(location).ok().and_then(|u| u.host_str().map(|h| h.to_string()))
}

pub const MAX_SERVER_SIDE_REDIRECTS: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_all_overrides_everything() {
        let classifier = RedirectClassifier::new(vec![], true);
        assert_eq!(classifier.classify("https://example.com/x"), RedirectDecision::FollowServerSide);
    }

    #[test]
    fn default_blocked_host_is_followed() {
        let classifier = RedirectClassifier::new(vec![], false);
        assert_eq!(
            classifier.classify("https://bucket.s3.amazonaws.com/blob?sig=abc"),
            RedirectDecision::FollowServerSide
        );
    }

    #[test]
    fn unmatched_host_is_relayed() {
        let classifier = RedirectClassifier::new(vec![], false);
        assert_eq!(classifier.classify("https://cdn.example.com/blob"), RedirectDecision::RelayToClient);
    }

    #[test]
    fn extra_blocked_host_from_config_is_honored() {
        let classifier = RedirectClassifier::new(vec!["mirror.internal".to_string()], false);
        assert_eq!(
            classifier.classify("https://blob.mirror.internal/x"),
            RedirectDecision::FollowServerSide
        );
    }

    #[test]
    fn unparseable_location_treated_as_unmatched() {
        let classifier = RedirectClassifier::new(vec![], false);
        assert_eq!(classifier.classify("not a url"), RedirectDecision::RelayToClient);
    }
}
