//! Deterministic container naming.
//!
//! The same `(user, workspace)` pair always resolves to the same sandbox
//! identity, so every command can find the container again without any
//! local state.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Container name: `aibox-<sanitized_user>-<hex12>` where `hex12` is the
/// first 12 hex chars of the SHA-256 of the workspace path.
pub fn container_name(user: &str, workspace: &Path) -> String {
    format!(
        "aibox-{}-{}",
        sanitize_user(user),
        workspace_hash(workspace)
    )
}

/// Lowercase the user id and squeeze anything outside `[a-z0-9-]` to a
/// single dash. An id with nothing usable becomes `user`.
pub fn sanitize_user(user: &str) -> String {
    let mut out = String::with_capacity(user.len());
    let mut last_dash = false;
    for c in user.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "user".to_string()
    } else {
        trimmed.to_string()
    }
}

fn workspace_hash(workspace: &Path) -> String {
    let digest = Sha256::digest(workspace.to_string_lossy().as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_name() {
        let a = container_name("alice", Path::new("/home/alice/proj"));
        let b = container_name("alice", Path::new("/home/alice/proj"));
        assert_eq!(a, b);
        assert!(a.starts_with("aibox-alice-"));
        // prefix + 12 hex chars
        assert_eq!(a.len(), "aibox-alice-".len() + 12);
    }

    #[test]
    fn different_workspaces_different_names() {
        let a = container_name("alice", Path::new("/home/alice/proj-a"));
        let b = container_name("alice", Path::new("/home/alice/proj-b"));
        assert_ne!(a, b);
    }

    #[test]
    fn user_ids_are_sanitized() {
        assert_eq!(sanitize_user("Alice"), "alice");
        assert_eq!(sanitize_user("alice@corp.example"), "alice-corp-example");
        assert_eq!(sanitize_user("a  b!!c"), "a-b-c");
        assert_eq!(sanitize_user("__"), "user");
        assert_eq!(sanitize_user("--bob--"), "bob");
    }

    #[test]
    fn sanitized_user_is_container_safe() {
        let name = container_name("Weird User!!@Host", Path::new("/w"));
        assert!(
            name.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
    }
}
