//! Structural and containment checks for script paths and action ids.
//!
//! Both checks are plain predicates: every failing condition yields `false`,
//! nothing is raised to the caller.

use std::path::Path;

use tracing::warn;

/// Extension every runnable script must carry (compared case-insensitively).
pub const SCRIPT_EXTENSION: &str = ".ps1";

/// Characters that must never appear in a normalized script path.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '>', '<'];

const ACTION_MIN_LEN: usize = 2;
const ACTION_MAX_LEN: usize = 64;

/// Checks a script path before anything touches the filesystem.
///
/// - rejects empty / whitespace-only input and non UTF-8 paths
/// - rejects any `..` token
/// - normalizes to an absolute path (no symlink resolution)
/// - requires the `.ps1` extension and no shell metacharacters
/// - when `base_dir` is set, requires the path to live underneath it
pub fn is_valid_script_path(path: &Path, base_dir: Option<&Path>) -> bool {
    let Some(raw) = path.to_str() else {
        return false;
    };
    if raw.trim().is_empty() || raw.contains("..") {
        return false;
    }

    let Ok(normalized) = std::path::absolute(path) else {
        return false;
    };
    let Some(normalized) = normalized.to_str() else {
        return false;
    };

    if !normalized.to_lowercase().ends_with(SCRIPT_EXTENSION) {
        return false;
    }
    if normalized.contains(SHELL_METACHARACTERS) {
        return false;
    }

    if let Some(base) = base_dir {
        if !is_within(normalized, base) {
            warn!(
                "Script path {} is outside base directory {}",
                path.display(),
                base.display()
            );
            return false;
        }
    }

    true
}

/// Case-insensitive containment on a path-component boundary.
fn is_within(normalized: &str, base: &Path) -> bool {
    let Ok(base) = std::path::absolute(base) else {
        return false;
    };
    let Some(base) = base.to_str() else {
        return false;
    };
    let base = base.trim_end_matches(['/', '\\']).to_lowercase();
    let candidate = normalized.to_lowercase();

    candidate
        .strip_prefix(&base)
        .is_some_and(|rest| rest.starts_with(std::path::is_separator))
}

/// Action ids become interpreter arguments, so they are restricted to
/// `[A-Za-z0-9_-]{2,64}`.
pub fn is_valid_action(action: &str) -> bool {
    (ACTION_MIN_LEN..=ACTION_MAX_LEN).contains(&action.len())
        && action
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
