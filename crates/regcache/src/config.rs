//! Environment-shaped configuration. Loaded once at startup with
//! `std::env::var` and small per-key parsing helpers, since every
//! documented configuration knob in this system is an environment variable.

use std::time::Duration;

pub struct Config {
    pub port: u16,
    pub cache_dir: String,
    pub cache_enabled: bool,
    pub manifest_tag_ttl: chrono::Duration,
    pub manifest_digest_ttl: chrono::Duration,
    pub blob_ttl: chrono::Duration,
    pub custom_domain: String,
    pub blocked_hosts: Vec<String>,
    pub follow_all_redirects: bool,
    pub dns_enabled: bool,
    pub dns_servers: Vec<String>,
    pub dns_timeout: Duration,
    pub debug: bool,
    pub target_upstream: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_u16("PORT", 8080),
            cache_dir: std::env::var("CACHE_DIR").unwrap_or_else(|_| "./cache".to_string()),
            cache_enabled: env_bool("CACHE_ENABLED", true),
            manifest_tag_ttl: env_duration("CACHE_MANIFEST_TTL", chrono::Duration::hours(24)),
            manifest_digest_ttl: env_duration("CACHE_MANIFEST_TTL_DIGEST", chrono::Duration::days(365)),
            blob_ttl: env_duration("CACHE_BLOB_TTL", chrono::Duration::days(365)),
            custom_domain: std::env::var("CUSTOM_DOMAIN").unwrap_or_else(|_| "example.com".to_string()),
            blocked_hosts: std::env::var("BLOCKED_HOSTS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            follow_all_redirects: env_bool("FOLLOW_ALL_REDIRECTS", false),
            dns_enabled: env_bool("DNS_ENABLED", false),
            dns_servers: std::env::var("DNS_SERVERS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            dns_timeout: env_duration("DNS_TIMEOUT", chrono::Duration::seconds(5))
                .to_std()
                .unwrap_or(Duration::from_secs(5)),
            debug: env_bool("DEBUG", false),
            target_upstream: std::env::var("TARGET_UPSTREAM").ok(),
        }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parses a duration with the extended suffix set `s/m/h/d/w/M/y` in
/// addition to a bare integer (seconds). Falls back to `default` on any
/// parse failure.
fn env_duration(key: &str, default: chrono::Duration) -> chrono::Duration {
    match std::env::var(key) {
        Ok(v) => parse_duration_ext(&v).unwrap_or(default),
        Err(_) => default,
    }
}

pub fn parse_duration_ext(input: &str) -> Option<chrono::Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let (number_part, unit) = input.split_at(input.len() - 1);
    let (value, unit) = if unit.chars().all(|c| c.is_ascii_digit()) {
        (input.parse::<i64>().ok()?, 's')
    } else {
        (number_part.parse::<i64>().ok()?, unit.chars().next()?)
    };
    let duration = match unit {
        's' => chrono::Duration::seconds(value),
        'm' => chrono::Duration::minutes(value),
        'h' => chrono::Duration::hours(value),
        'd' => chrono::Duration::days(value),
        'w' => chrono::Duration::weeks(value),
        'M' => chrono::Duration::days(value * 30),
        'y' => chrono::Duration::days(value * 365),
        _ => return None,
    };
    Some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration_ext("30"), Some(chrono::Duration::seconds(30)));
    }

    #[test]
    fn parses_extended_suffixes() {
        assert_eq!(parse_duration_ext("2d"), Some(chrono::Duration::days(2)));
        assert_eq!(parse_duration_ext("1w"), Some(chrono::Duration::weeks(1)));
        assert_eq!(parse_duration_ext("3M"), Some(chrono::Duration::days(90)));
        assert_eq!(parse_duration_ext("1y"), Some(chrono::Duration::days(365)));
        assert_eq!(parse_duration_ext("24h"), Some(chrono::Duration::hours(24)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration_ext("abc"), None);
        assert_eq!(parse_duration_ext(""), None);
    }
}
