//! Path sanitization shared by the mount engine and every archiver.

use crate::error::Error;

/// Rewrites a user-supplied virtual path into canonical form.
///
/// Leading slashes are stripped, consecutive `/` collapse, trailing `/` is
/// dropped, and `\`, `:`, `.`, and `..` segments are rejected outright — the
/// caller wrote garbage and nothing here attempts to normalize it away.
/// The result never begins or ends with `/` and never contains an empty
/// segment.
pub fn sanitize(raw: &str) -> Result<String, Error> {
    if raw.contains('\\') || raw.contains(':') {
        return Err(Error::BadFilename);
    }
    let mut out = String::with_capacity(raw.len());
    for segment in raw.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(Error::BadFilename);
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    Ok(out)
}

/// True when `sanitize` would accept `raw` and produce a non-empty result.
pub fn is_sane_non_empty(raw: &str) -> bool {
    matches!(sanitize(raw), Ok(p) if !p.is_empty())
}

/// Splits a canonical path into its component segments.
pub fn segments(canonical: &str) -> impl Iterator<Item = &str> {
    canonical.split('/').filter(|s| !s.is_empty())
}

/// Returns the parent directory of a canonical path, or `""` for a root-level entry.
pub fn dirname(canonical: &str) -> &str {
    match canonical.rfind('/') {
        Some(idx) => &canonical[..idx],
        None => "",
    }
}

/// Returns the final component of a canonical path.
pub fn basename(canonical: &str) -> &str {
    match canonical.rfind('/') {
        Some(idx) => &canonical[idx + 1..],
        None => canonical,
    }
}

/// Case-insensitive ASCII comparison, used by the legacy flat-format backends.
pub fn ascii_ci_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let a = a.as_bytes().iter().map(u8::to_ascii_lowercase);
    let b = b.as_bytes().iter().map(u8::to_ascii_lowercase);
    a.cmp(b)
}

/// Case-insensitive UTF-8 comparison (simple lowercase fold, no locale).
pub fn utf8_ci_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_and_trailing_slashes() {
        assert_eq!(sanitize("/a/b/").unwrap(), "a/b");
    }

    #[test]
    fn collapses_consecutive_slashes() {
        assert_eq!(sanitize("//a///b/").unwrap(), "a/b");
    }

    #[test]
    fn rejects_dot_and_dotdot_segments() {
        assert_eq!(sanitize("a/../b"), Err(Error::BadFilename));
        assert_eq!(sanitize("./a"), Err(Error::BadFilename));
    }

    #[test]
    fn rejects_backslash_and_colon() {
        assert_eq!(sanitize("a\\b"), Err(Error::BadFilename));
        assert_eq!(sanitize("a:b"), Err(Error::BadFilename));
    }

    #[test]
    fn is_idempotent() {
        let p = "a//b/c/";
        let once = sanitize(p).unwrap();
        let twice = sanitize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn equivalent_paths_sanitize_identically() {
        assert_eq!(sanitize("//a///b/").unwrap(), sanitize("a/b").unwrap());
    }
}
