//! Logical namespace paths.
//!
//! Namespace paths are `/`-separated strings rooted at `/`, independent of
//! the host platform. Every stored path is absolute and normalized: no empty
//! segments, no `.` or `..`, and no trailing separator except for the root.

/// The namespace root
pub const ROOT: &str = "/";

/// Separator between path segments
pub const SEPARATOR: char = '/';

/// Normalize `path` as an absolute path.
///
/// Relative input is treated as relative to the root. `..` at the root stays
/// at the root, so the result never escapes it.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        ROOT.to_string()
    } else {
        let mut out = String::with_capacity(path.len() + 1);
        for segment in segments {
            out.push(SEPARATOR);
            out.push_str(segment);
        }
        out
    }
}

/// Resolve `path` against the working directory `cwd` and normalize it.
pub fn resolve(cwd: &str, path: &str) -> String {
    if path.starts_with(SEPARATOR) {
        normalize(path)
    } else {
        normalize(&format!("{}{}{}", cwd, SEPARATOR, path))
    }
}

/// Parent of a normalized path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final segment of a normalized path; empty for the root.
pub fn base_name(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a directory path and a single child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("{}{}", ROOT, name)
    } else {
        format!("{}{}{}", dir, SEPARATOR, name)
    }
}

/// Whether `path` is `prefix` itself or lies below it.
///
/// Matching is by whole segments: `/a/b` is within `/a`, `/ab` is not.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == ROOT {
        return path.starts_with(SEPARATOR);
    }
    path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with(SEPARATOR))
}

/// Replace the leading `old` segments of `path` with `new`.
///
/// Returns `None` when `path` is not within `old`.
pub fn rebase(path: &str, old: &str, new: &str) -> Option<String> {
    if !is_within(path, old) || old == ROOT {
        return None;
    }
    Some(format!("{}{}", new, &path[old.len()..]))
}
