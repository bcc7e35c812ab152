use std::path::{Component, Path, PathBuf};

/// Collapse `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => normalized.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
        }
    }
    normalized
}

/// Normalized lookup key for the source index: forward slashes, lower case.
/// GZDoom reports lump paths with whatever casing the archive carries, so the
/// index has to be case-insensitive across the board.
pub fn index_key(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

/// Normalized form used for project-root prefix matching: forward slashes,
/// with only the drive/volume portion folded to lower case.  The rest of the
/// path keeps its case.
pub fn prefix_key(path: &str) -> String {
    let mut unified = path.replace('\\', "/");
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = unified[..1].to_lowercase();
        unified.replace_range(..1, &drive);
    }
    unified
}

/// Whether `path` is absolute in either the host's or Windows' notation.
/// Paths arrive from the debuggee in the debuggee's convention, which on a
/// Windows game host differs from ours.
pub fn is_absolute_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    Path::new(path).is_absolute()
        || path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic())
}

/// Last path component, tolerating both separator styles.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Join a debuggee-relative path onto a project root, unifying separators.
pub fn join_relative(root: &Path, relative: &str) -> String {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches(['/', '\\']);
    format!("{}/{}", root, relative.replace('\\', "/").trim_start_matches('/'))
}

/// Make `path` relative to `root`, or None if it does not live under it.
/// The drive portion compares case-insensitively, the rest does not.
pub fn strip_root<'p>(root: &str, path: &'p str) -> Option<&'p str> {
    let root_key = prefix_key(root);
    let root_key = root_key.trim_end_matches('/');
    let path_key = prefix_key(path);
    if !path_key.starts_with(root_key) {
        return None;
    }
    let rest = &path[root_key.len()..];
    let rest = rest.strip_prefix(['/', '\\'])?;
    if rest.starts_with("..") {
        return None;
    }
    Some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/foo/bar"), Path::new("/foo/bar"));
        assert_eq!(normalize_path("foo/bar"), Path::new("foo/bar"));
        assert_eq!(normalize_path("/foo/bar/./baz/./../"), Path::new("/foo/bar"));
    }

    #[test]
    fn test_index_key() {
        assert_eq!(index_key(r"C:\Mods\Foo.ZS"), "c:/mods/foo.zs");
        assert_eq!(index_key("/proj/src/a.zs"), "/proj/src/a.zs");
    }

    #[test]
    fn test_prefix_key_folds_drive_only() {
        assert_eq!(prefix_key(r"C:\Mods\Foo"), "c:/Mods/Foo");
        assert_eq!(prefix_key("/Proj/Src"), "/Proj/Src");
    }

    #[test]
    fn test_strip_root() {
        assert_eq!(strip_root("/proj", "/proj/src/a.zs"), Some("src/a.zs"));
        assert_eq!(strip_root("/proj/", "/proj/src/a.zs"), Some("src/a.zs"));
        assert_eq!(strip_root("/proj", "/other/a.zs"), None);
        assert_eq!(strip_root(r"C:\proj", r"c:\proj\a.zs"), Some("a.zs"));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("src/a.zs"), "a.zs");
        assert_eq!(basename(r"src\a.zs"), "a.zs");
        assert_eq!(basename("a.zs"), "a.zs");
    }

    #[test]
    fn test_is_absolute_path() {
        assert!(is_absolute_path("/proj/a.zs"));
        assert!(is_absolute_path(r"C:\proj\a.zs"));
        assert!(!is_absolute_path("src/a.zs"));
        assert!(!is_absolute_path(r"src\a.zs"));
    }
}
