// Document path keys: NFKC normalization, `/` separators, traversal rejection.
//
// Editors on different platforms report the same project-relative file as
// `\src\a.txt` or `/src/a.txt`; both must land on the same table key.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed path length in characters.
const MAX_PATH_CHARS: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path contains directory traversal component: {0}")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,
}

/// Canonical key for a project-relative document path.
///
/// - Unicode NFKC normalization
/// - `\` becomes `/`, repeated separators collapse
/// - leading and trailing separators are stripped
/// - `.` and `..` components are rejected
pub fn normalize_path(input: &str) -> Result<String, PathError> {
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let normalized: String = input.nfkc().collect();
    let unified = normalized.replace('\\', "/");
    let components: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();

    if components.is_empty() {
        return Err(PathError::Empty);
    }

    if let Some(bad) = components.iter().find(|c| **c == "." || **c == "..") {
        return Err(PathError::Traversal((*bad).to_string()));
    }

    let result = components.join("/");
    if result.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(result)
}

/// Table key for a reported path. Paths that fail normalization only get
/// their separators unified.
pub fn document_key(input: &str) -> String {
    normalize_path(input).unwrap_or_else(|_| input.replace('\\', "/"))
}

/// Whether two reported paths name the same document.
///
/// Paths that fail normalization are compared after separator unification
/// only, so a peer reporting an odd path still matches itself.
pub fn paths_match(a: &str, b: &str) -> bool {
    document_key(a) == document_key(b)
}
