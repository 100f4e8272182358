// tandem-common: shared types and utilities for the Tandem workspace

pub mod error;
pub mod line_table;
pub mod path;
pub mod protocol;
pub mod types;
