pub mod normalize;

pub use normalize::{document_key, normalize_path, paths_match, PathError};
