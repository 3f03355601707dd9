//! Docker Hub path and scope rewriting.

/// Result of inspecting a `/v2/...` path for the single-segment shortcut.
pub struct PathRewrite {
    pub rewritten_path: String,
}

/// On a `/v2/<name>/<kind>/<ref>` request (exactly one segment for the
/// repository name) targeting Docker Hub, returns the rewritten path using
/// the `library/<name>` convention. Returns `None` when the path already
/// has a namespace or doesn't match the registry shape.
pub fn rewrite_library_path(path: &str) -> Option<PathRewrite> {
    let rest = path.strip_prefix("/v2/")?;
    let segments: Vec<&str> = rest.split('/').collect();
    // exactly "<name>/<kind>/<ref>" -> 3 segments, no namespace slash in name.
    if segments.len() != 3 {
        return None;
    }
    let name = segments[0];
    if name.is_empty() || name == "library" {
        return None;
    }
    let kind = segments[1];
    if kind != "manifests" && kind != "blobs" {
        return None;
    }
    Some(PathRewrite { rewritten_path: format!("/v2/library/{name}/{}/{}", segments[1], segments[2]) })
}

/// Rewrites a token-request `scope` of the form `repository:<name>:<action>`
/// to `repository:library/<name>:<action>` when `<name>` has no namespace.
pub fn rewrite_scope(scope: &str) -> String {
    let mut parts = scope.splitn(3, ':');
    let (Some(kind), Some(name), Some(action)) = (parts.next(), parts.next(), parts.next()) else {
        return scope.to_string();
    };
    if kind != "repository" || name.contains('/') || name.is_empty() {
        return scope.to_string();
    }
    format!("repository:library/{name}:{action}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_single_segment_manifest_path() {
        let rewrite = rewrite_library_path("/v2/nginx/manifests/latest").unwrap();
        assert_eq!(rewrite.rewritten_path, "/v2/library/nginx/manifests/latest");
    }

    #[test]
    fn leaves_namespaced_path_alone() {
        assert!(rewrite_library_path("/v2/library/nginx/manifests/latest").is_none());
        assert!(rewrite_library_path("/v2/someorg/nginx/manifests/latest").is_none());
    }

    #[test]
    fn rewrites_unscoped_repository_scope() {
        assert_eq!(rewrite_scope("repository:nginx:pull"), "repository:library/nginx:pull");
    }

    #[test]
    fn leaves_namespaced_scope_alone() {
        assert_eq!(rewrite_scope("repository:someorg/nginx:pull"), "repository:someorg/nginx:pull");
    }

    #[test]
    fn leaves_non_repository_scope_alone() {
        assert_eq!(rewrite_scope("registry:catalog:*"), "registry:catalog:*");
    }
}
