//! Virtual path utilities
//!
//! Virtual paths always use `/` as separator and are rooted at `/`, whatever
//! the host OS. These helpers never touch the filesystem.

/// Lexically clean a virtual path, rooting it at `/`.
///
/// `.` components are dropped and `..` pops the previous component,
/// clamping at the root.
///
/// # Examples
/// ```
/// # use sftpd::vfs::path_utils::clean_path;
/// assert_eq!(clean_path("/tmp/../path"), "/path");
/// assert_eq!(clean_path("../.."), "/");
/// assert_eq!(clean_path("tmp//a/"), "/tmp/a");
/// ```
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Clean a virtual path that must not climb above the root.
///
/// Returns `None` when `..` components escape the root, e.g. `../upper`.
pub fn clean_relative_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(format!("/{}", parts.join("/")))
}

/// Normalize a path argument received in an exec command line.
///
/// Surrounding quotes are trimmed, the result is cleaned and rooted at `/`
/// and a trailing slash in the input is preserved.
pub fn clean_command_path(name: &str) -> String {
    let name = name.trim_matches('\'').trim_matches('"');
    let mut result = clean_path(name);
    if name.ends_with('/') && !result.ends_with('/') {
        result.push('/');
    }
    result
}

/// Parent of a virtual path, `/` is its own parent.
pub fn parent_dir(path: &str) -> String {
    let clean = clean_path(path);
    match clean.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => clean[..idx].to_string(),
    }
}

/// Last component of a virtual path, `/` for the root.
pub fn base_name(path: &str) -> String {
    let clean = clean_path(path);
    match clean.rsplit('/').next() {
        Some("") | None => "/".to_string(),
        Some(name) => name.to_string(),
    }
}

/// Join virtual path components using `/` separator.
pub fn join_virtual_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        clean_path(&format!("{}{}", base, component))
    } else {
        clean_path(&format!("{}/{}", base, component))
    }
}

/// The path itself followed by all of its parents, deepest first.
///
/// `/1/2/3` yields `["/1/2/3", "/1/2", "/1", "/"]`.
pub fn dirs_for_path(path: &str) -> Vec<String> {
    let mut current = clean_path(path);
    let mut dirs = vec![current.clone()];
    while current != "/" {
        current = parent_dir(&current);
        dirs.push(current.clone());
    }
    dirs
}

/// Whether `child` is `parent` itself or lies below it.
pub fn is_sub_path(parent: &str, child: &str) -> bool {
    parent == "/" || child == parent || child.starts_with(&format!("{}/", parent))
}
