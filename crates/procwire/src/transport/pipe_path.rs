//! Platform-aware endpoint naming for the local-endpoint transport (C3, C10).

use std::path::PathBuf;

use crate::error::TransportError;

const NON_WINDOWS_PATH_LIMIT: usize = 104;

/// Sanitize to `[A-Za-z0-9-]`, collapsing consecutive underscores (which
/// sanitization itself introduces for any other byte) and trimming leading
/// and trailing underscores.
fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else {
            out.push('_');
        }
    }

    let mut collapsed = String::with_capacity(out.len());
    let mut last_was_underscore = false;
    for c in out.chars() {
        if c == '_' {
            if !last_was_underscore {
                collapsed.push(c);
            }
            last_was_underscore = true;
        } else {
            collapsed.push(c);
            last_was_underscore = false;
        }
    }

    collapsed.trim_matches('_').to_string()
}

/// Returns a platform-appropriate endpoint path for `namespace`/`process_id`.
///
/// Windows: `\\.\pipe\<namespace>-<processId>` (no length limit).
/// Elsewhere: `<base_dir or tmp>/<namespace>-<processId>.sock`, validated to
/// be at most 104 bytes.
pub fn for_module(
    namespace: &str,
    process_id: &str,
    base_dir: Option<&std::path::Path>,
) -> Result<String, TransportError> {
    let name = format!("{}-{}", sanitize(namespace), sanitize(process_id));

    if cfg!(windows) {
        return Ok(format!(r"\\.\pipe\{name}"));
    }

    let dir = base_dir
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let path = dir.join(format!("{name}.sock"));
    let path_str = path.to_string_lossy().into_owned();

    if path_str.len() > NON_WINDOWS_PATH_LIMIT {
        return Err(TransportError::PathTooLong {
            path: path_str,
            limit: NON_WINDOWS_PATH_LIMIT,
        });
    }

    Ok(path_str)
}

/// Remove a stale socket file left behind by a previous run. No-op on
/// Windows (named pipes have no filesystem artifact to clean up).
pub fn cleanup(path: &str) -> std::io::Result<()> {
    if cfg!(windows) {
        return Ok(());
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_special_characters() {
        assert_eq!(sanitize("my service!!"), "my_service");
        assert_eq!(sanitize("__leading"), "leading");
        assert_eq!(sanitize("trailing__"), "trailing");
        assert_eq!(sanitize("a___b"), "a_b");
        assert_eq!(sanitize("plain-name"), "plain-name");
    }

    #[test]
    fn builds_expected_non_windows_path() {
        if cfg!(windows) {
            return;
        }
        let dir = std::path::Path::new("/tmp");
        let path = for_module("procwire", "42", Some(dir)).unwrap();
        assert_eq!(path, "/tmp/procwire-42.sock");
    }

    #[test]
    fn rejects_overlong_non_windows_path() {
        if cfg!(windows) {
            return;
        }
        let huge_dir = "/tmp/".to_string() + &"x".repeat(200);
        let err = for_module("ns", "id", Some(std::path::Path::new(&huge_dir))).unwrap_err();
        assert!(matches!(err, TransportError::PathTooLong { .. }));
    }
}
