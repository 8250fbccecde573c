use unicode_normalization::UnicodeNormalization;

use super::{FsError, FsResult};

/// Normalize a UTF-8 string to NFC.
pub fn normalize_nfc(input: &str) -> String {
    input.nfc().collect::<String>()
}

/// Validate a stored logical path (a record key):
/// - UTF-8 string, segments separated by '/'
/// - NUL ("\u{0000}") not allowed
/// - '/' only used as separator; no empty segments (disallow leading/trailing or '//' sequences)
/// - no '.' or '..' segments
pub fn validate_logical_path(path: &str) -> FsResult<()> {
    if path.is_empty() {
        return Err(FsError::InvalidPath("logical path cannot be empty".into()));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(FsError::InvalidPath(format!("leading or trailing '/' in '{}'", path)));
    }
    for seg in path.split('/') {
        validate_segment(seg)?;
    }
    Ok(())
}

/// Validate a single path segment (a filename or directory name).
pub fn validate_segment(seg: &str) -> FsResult<()> {
    if seg.is_empty() {
        return Err(FsError::InvalidPath("empty segment in logical path".into()));
    }
    if seg.contains('\u{0000}') {
        return Err(FsError::InvalidPath("logical path cannot contain NUL characters".into()));
    }
    if seg.contains('/') || seg.contains('\\') {
        return Err(FsError::InvalidPath(format!("separator inside segment '{}'", seg)));
    }
    if seg == "." || seg == ".." {
        return Err(FsError::InvalidPath("segments '.' and '..' are not allowed".into()));
    }
    Ok(())
}

/// Turn caller input (URL paths like `/a//b/`, `a/./b`) into the canonical key form:
/// NFC, no leading/trailing '/', no empty or '.' segments. The root is `""`.
/// `..` is rejected rather than resolved.
pub fn clean_logical_path(raw: &str) -> FsResult<String> {
    let nfc = normalize_nfc(raw);
    let mut segs: Vec<&str> = Vec::new();
    for seg in nfc.split('/') {
        if seg.is_empty() || seg == "." { continue; }
        validate_segment(seg)?;
        segs.push(seg);
    }
    Ok(segs.join("/"))
}

/// Join a directory (any caller form) and a single filename into a canonical record key.
pub fn join_logical(dir: &str, filename: &str) -> FsResult<String> {
    let dir = clean_logical_path(dir)?;
    let name = normalize_nfc(filename);
    validate_segment(&name)?;
    if dir.is_empty() {
        Ok(name)
    } else {
        Ok(format!("{}/{}", dir, name))
    }
}

/// Key prefix shared by every descendant of `dir` (`""` for the root).
pub fn dir_prefix(dir: &str) -> String {
    if dir.is_empty() { String::new() } else { format!("{}/", dir) }
}

/// Split a canonical path into (parent, name). The parent of a top-level entry is `""`.
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// All strict ancestors of a canonical path, nearest last: `a/b/c` -> [`a`, `a/b`].
pub fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/').map(|(pos, _)| &path[..pos]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nfc_composes() {
        let s = "Cafe\u{0301}";
        assert_eq!(normalize_nfc(s), "Caf\u{e9}");
    }

    #[test]
    fn clean_strips_url_noise() {
        assert_eq!(clean_logical_path("/").unwrap(), "");
        assert_eq!(clean_logical_path("").unwrap(), "");
        assert_eq!(clean_logical_path("/courses//math/./").unwrap(), "courses/math");
        assert!(clean_logical_path("/a/../etc").is_err());
        assert!(clean_logical_path("a\u{0000}b").is_err());
    }

    #[test]
    fn join_validates_filename() {
        assert_eq!(join_logical("/", "x.txt").unwrap(), "x.txt");
        assert_eq!(join_logical("/a/b/", "x.txt").unwrap(), "a/b/x.txt");
        assert!(join_logical("a", "b/c.txt").is_err());
        assert!(join_logical("a", "..").is_err());
        assert!(join_logical("a", "").is_err());
    }

    #[test]
    fn invalid_record_keys() {
        assert!(validate_logical_path("").is_err());
        assert!(validate_logical_path("/leading").is_err());
        assert!(validate_logical_path("trailing/").is_err());
        assert!(validate_logical_path("double//slash").is_err());
        assert!(validate_logical_path("a/./b").is_err());
        validate_logical_path("a/b/c.pdf").unwrap();
    }

    #[test]
    fn parents_and_ancestors() {
        assert_eq!(split_parent("a/b/c.txt"), ("a/b", "c.txt"));
        assert_eq!(split_parent("c.txt"), ("", "c.txt"));
        assert_eq!(ancestors("a/b/c.txt"), vec!["a", "a/b"]);
        assert!(ancestors("c.txt").is_empty());
        assert_eq!(dir_prefix(""), "");
        assert_eq!(dir_prefix("a/b"), "a/b/");
    }
}
