//! Path validation for webhook-supplied directory hints.
//!
//! Every filesystem argument that originates outside the process flows through
//! [`resolve`], which rejects traversal and shell-metacharacter payloads and
//! confirms, after canonicalization, that the result stays inside the
//! configured base directory.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Error type for path validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathGuardError {
    /// Hint is empty.
    #[error("path hint is empty")]
    Empty,

    /// Hint contains a forbidden byte or pattern.
    #[error("path hint contains forbidden pattern: {0}")]
    Forbidden(&'static str),

    /// Canonicalized hint escapes the base directory.
    #[error("path escapes the allowed base directory")]
    OutsideBase,

    /// Path must exist but does not.
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    /// Filesystem error during canonicalization.
    #[error("failed to resolve path: {0}")]
    Io(String),
}

/// Characters that never appear in a legitimate directory basename and are
/// common in injection payloads.
const DANGEROUS_CHARS: &[(char, &str)] = &[
    ('~', "~"),
    ('$', "$"),
    ('`', "backtick"),
    (';', "semicolon"),
];

/// Screens a hint string before any filesystem access.
///
/// Rejects null bytes, control characters, backslashes, absolute paths,
/// drive letters, `..` segments, and shell metacharacters.
pub fn screen_hint(hint: &str) -> Result<(), PathGuardError> {
    if hint.is_empty() {
        return Err(PathGuardError::Empty);
    }
    if hint.bytes().any(|b| b == 0) {
        return Err(PathGuardError::Forbidden("null byte"));
    }
    if hint.chars().any(|c| (c as u32) < 0x20) {
        return Err(PathGuardError::Forbidden("control character"));
    }
    if hint.contains('\\') {
        return Err(PathGuardError::Forbidden("backslash"));
    }
    if hint.starts_with('/') {
        return Err(PathGuardError::Forbidden("absolute path"));
    }
    // Hints name a single directory under the base, never a subpath
    if hint.contains('/') {
        return Err(PathGuardError::Forbidden("path separator"));
    }
    // Windows drive letters ("C:...") never occur in valid hints
    let bytes = hint.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(PathGuardError::Forbidden("drive letter"));
    }
    for component in Path::new(hint).components() {
        if matches!(component, Component::ParentDir) {
            return Err(PathGuardError::Forbidden(".. segment"));
        }
    }
    for (ch, name) in DANGEROUS_CHARS {
        if hint.contains(*ch) {
            return Err(PathGuardError::Forbidden(name));
        }
    }
    Ok(())
}

/// Resolves `hint` against `base`, enforcing containment.
///
/// The hint is screened, joined to the canonicalized base, canonicalized
/// itself (so symlinks cannot escape), and then checked to be `base` or a
/// descendant of it. With `must_exist` unset, a hint naming a path that does
/// not exist yet resolves lexically; the screen already guarantees it cannot
/// point outside the base.
pub fn resolve(base: &Path, hint: &str, must_exist: bool) -> Result<PathBuf, PathGuardError> {
    screen_hint(hint)?;

    let base_canon = base
        .canonicalize()
        .map_err(|e| PathGuardError::Io(format!("base {}: {}", base.display(), e)))?;

    let joined = base_canon.join(hint);

    let candidate = match joined.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if must_exist {
                return Err(PathGuardError::NotFound(joined));
            }
            joined
        }
        Err(e) => return Err(PathGuardError::Io(e.to_string())),
    };

    if candidate != base_canon && !candidate.starts_with(&base_canon) {
        return Err(PathGuardError::OutsideBase);
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_plain_basename() {
        let base = TempDir::new().unwrap();
        std::fs::create_dir(base.path().join("Inception (2010)")).unwrap();

        let resolved = resolve(base.path(), "Inception (2010)", true).unwrap();
        assert!(resolved.ends_with("Inception (2010)"));
        assert!(resolved.starts_with(base.path().canonicalize().unwrap()));
    }

    #[test]
    fn test_resolve_missing_requires_existence() {
        let base = TempDir::new().unwrap();
        let err = resolve(base.path(), "Ghost", true).unwrap_err();
        assert!(matches!(err, PathGuardError::NotFound(_)));
    }

    #[test]
    fn test_resolve_missing_allowed_when_lenient() {
        let base = TempDir::new().unwrap();
        let resolved = resolve(base.path(), "Ghost", false).unwrap();
        assert!(resolved.ends_with("Ghost"));
    }

    #[test]
    fn test_rejects_traversal_segments() {
        let base = TempDir::new().unwrap();
        assert_eq!(
            resolve(base.path(), "..", false).unwrap_err(),
            PathGuardError::Forbidden(".. segment")
        );
        for hint in ["../etc", "a/../../etc", "a/b"] {
            let err = resolve(base.path(), hint, false).unwrap_err();
            assert_eq!(err, PathGuardError::Forbidden("path separator"), "hint {hint:?}");
        }
    }

    #[test]
    fn test_rejects_absolute_and_drive_paths() {
        let base = TempDir::new().unwrap();
        assert_eq!(
            resolve(base.path(), "/etc/passwd", false).unwrap_err(),
            PathGuardError::Forbidden("absolute path")
        );
        assert_eq!(
            resolve(base.path(), "C:stuff", false).unwrap_err(),
            PathGuardError::Forbidden("drive letter")
        );
        assert_eq!(
            resolve(base.path(), "a\\b", false).unwrap_err(),
            PathGuardError::Forbidden("backslash")
        );
    }

    #[test]
    fn test_rejects_null_and_control_bytes() {
        let base = TempDir::new().unwrap();
        assert_eq!(
            resolve(base.path(), "movie\0", false).unwrap_err(),
            PathGuardError::Forbidden("null byte")
        );
        assert_eq!(
            resolve(base.path(), "movie\x07", false).unwrap_err(),
            PathGuardError::Forbidden("control character")
        );
    }

    #[test]
    fn test_rejects_shell_metacharacters() {
        let base = TempDir::new().unwrap();
        for hint in ["~root", "$HOME", "a`id`", "a;rm"] {
            assert!(
                matches!(
                    resolve(base.path(), hint, false),
                    Err(PathGuardError::Forbidden(_))
                ),
                "hint {hint:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_symlink_escape_is_caught() {
        let base = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), base.path().join("escape")).unwrap();

        let err = resolve(base.path(), "escape", true).unwrap_err();
        assert_eq!(err, PathGuardError::OutsideBase);
    }

    #[test]
    fn test_empty_hint_rejected() {
        let base = TempDir::new().unwrap();
        assert_eq!(
            resolve(base.path(), "", false).unwrap_err(),
            PathGuardError::Empty
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        // Any hint surviving the screen resolves inside the base.
        #[test]
        fn prop_resolved_paths_stay_contained(hint in "[a-zA-Z0-9 ().'_-]{1,40}") {
            let base = TempDir::new().unwrap();
            let base_canon = base.path().canonicalize().unwrap();

            if let Ok(resolved) = resolve(base.path(), &hint, false) {
                prop_assert!(
                    resolved == base_canon || resolved.starts_with(&base_canon),
                    "resolved {:?} escaped {:?}", resolved, base_canon
                );
            }
        }

        // Hints carrying any forbidden marker never resolve.
        #[test]
        fn prop_forbidden_markers_always_rejected(
            prefix in "[a-zA-Z0-9]{0,10}",
            marker in prop_oneof![
                Just("..".to_string()),
                Just("/".to_string()),
                Just("\\".to_string()),
                Just("\0".to_string()),
                Just("~".to_string()),
                Just("$".to_string()),
            ],
            suffix in "[a-zA-Z0-9]{0,10}",
        ) {
            let base = TempDir::new().unwrap();
            // ".." only counts as a traversal when it forms a whole segment;
            // build one explicitly so the property holds for every marker.
            let hint = if marker == ".." {
                format!("{}/../{}", prefix, suffix)
            } else {
                format!("{}{}{}", prefix, marker, suffix)
            };

            prop_assert!(resolve(base.path(), &hint, false).is_err(), "hint {:?}", hint);
        }
    }
}
