//! # Path Conventions
//!
//! The service permits `/` inside names, so derived paths escape it:
//! `\` becomes `\\` and `/` becomes `\/` within a segment. Splitting
//! honors the escapes, so `path(resolve(p)) == p` holds for any name
//! the server can produce.

/// Escapes one name for embedding in a path.
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            _ => out.push(c),
        }
    }
    out
}

/// Joins an escaped segment onto a directory path.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", escape(name))
    } else {
        format!("{dir}/{}", escape(name))
    }
}

/// Splits an absolute path into unescaped segments. Empty segments
/// (doubled or trailing slashes) are dropped.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in path.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '/' {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// The extension of a name, dot included; empty when there is none.
/// A leading dot alone does not count as an extension.
pub fn file_ext(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &name[idx..],
    }
}

#[cfg(test)]
mod test {
    use super::{escape, file_ext, join_path, split_path};

    #[test]
    fn test_escape_roundtrip() {
        let name = "a/b\\c";
        let path = join_path("/docs", name);
        assert_eq!(path, "/docs/a\\/b\\\\c");
        let segments = split_path(&path);
        assert_eq!(segments, vec!["docs".to_string(), name.to_string()]);
    }

    #[test]
    fn test_join_at_root() {
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_split_plain() {
        assert_eq!(split_path("/"), Vec::<String>::new());
        assert_eq!(split_path("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("//a//b/"), vec!["a", "b"]);
    }

    #[test]
    fn test_file_ext() {
        assert_eq!(file_ext("movie.mkv"), ".mkv");
        assert_eq!(file_ext("archive.tar.gz"), ".gz");
        assert_eq!(file_ext("README"), "");
        assert_eq!(file_ext(".bashrc"), "");
    }
}
