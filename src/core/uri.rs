//! Validation and navigation helpers for repository uris
//!
//! Repository uris are `/`-rooted, slash-separated paths. The root collection is
//! `/`; every other uri has no trailing slash and no empty, `.` or `..` segments.
//! All other modules assume uris went through [`normalize`] first.

use crate::core::error::{RepositoryError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// The root collection
pub const ROOT: &str = "/";

/// Pattern for a single path segment: printable characters, no slash
const SEGMENT_PATTERN: &str = r"^[^/\x00-\x1f\x7f]+$";

/// Maximum length of a normalised uri
const MAX_LENGTH: usize = 4096;

fn segment_regex() -> &'static Regex {
    static SEGMENT: OnceLock<Regex> = OnceLock::new();
    SEGMENT.get_or_init(|| Regex::new(SEGMENT_PATTERN).expect("segment pattern is valid"))
}

/// Validate and normalise a uri
///
/// # Rules
/// - Must start with `/`
/// - A single trailing slash is dropped (except for the root itself)
/// - No empty segments (`//`), no `.` or `..` segments
/// - No control characters
///
/// # Examples
///
/// ```
/// use davrepo::core::uri::normalize;
///
/// assert_eq!(normalize("/docs/").unwrap(), "/docs");
/// assert_eq!(normalize("/").unwrap(), "/");
/// assert!(normalize("docs").is_err());
/// assert!(normalize("/docs/../etc").is_err());
/// ```
pub fn normalize(uri: &str) -> Result<String> {
    if !uri.starts_with('/') {
        return Err(RepositoryError::InvalidUri(format!(
            "'{}' must start with '/'",
            uri
        )));
    }

    if uri.len() > MAX_LENGTH {
        return Err(RepositoryError::InvalidUri(format!(
            "uri too long (max {} characters)",
            MAX_LENGTH
        )));
    }

    if uri == ROOT {
        return Ok(ROOT.to_string());
    }

    let trimmed = uri.strip_suffix('/').unwrap_or(uri);
    for segment in trimmed[1..].split('/') {
        if segment.is_empty() {
            return Err(RepositoryError::InvalidUri(format!(
                "'{}' contains an empty segment",
                uri
            )));
        }
        if segment == "." || segment == ".." {
            return Err(RepositoryError::InvalidUri(format!(
                "'{}' contains a relative segment",
                uri
            )));
        }
        if !segment_regex().is_match(segment) {
            return Err(RepositoryError::InvalidUri(format!(
                "'{}' contains illegal characters",
                uri
            )));
        }
    }

    Ok(trimmed.to_string())
}

/// Parent collection of a uri, `None` for the root
pub fn parent(uri: &str) -> Option<&str> {
    if uri == ROOT {
        return None;
    }
    match uri.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&uri[..idx]),
        None => None,
    }
}

/// Last segment of a uri (empty for the root)
pub fn name(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or("")
}

/// Append a segment to a collection uri
pub fn join(parent: &str, segment: &str) -> String {
    if parent == ROOT {
        format!("/{}", segment)
    } else {
        format!("{}/{}", parent, segment)
    }
}

/// True if `uri` lies strictly below `ancestor`
pub fn is_descendant(uri: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return uri != ROOT && uri.starts_with('/');
    }
    uri.len() > ancestor.len()
        && uri.starts_with(ancestor)
        && uri.as_bytes()[ancestor.len()] == b'/'
}

/// True if `uri` is `ancestor` itself or lies below it
pub fn is_same_or_descendant(uri: &str, ancestor: &str) -> bool {
    uri == ancestor || is_descendant(uri, ancestor)
}

/// Rewrite `uri` from below `from` to below `to`
///
/// Callers guarantee `is_same_or_descendant(uri, from)`.
pub fn rebase(uri: &str, from: &str, to: &str) -> String {
    if uri == from {
        return to.to_string();
    }
    let suffix = if from == ROOT {
        &uri[1..]
    } else {
        &uri[from.len() + 1..]
    };
    join(to, suffix)
}
