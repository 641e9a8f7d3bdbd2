//! Domain records shared by the scan engine and its storage backends
//!
//! Enum-valued fields are persisted as lowercase TEXT; `as_str` and
//! `FromStr` are the only conversions storage code should use.

pub mod keyword;
pub mod record;
pub mod run;
pub mod source;

pub use keyword::*;
pub use record::*;
pub use run::*;
pub use source::*;

/// Maximum stored length of a per-source error message
pub const MAX_OUTCOME_ERROR_CHARS: usize = 500;

/// Maximum length of an error summary kept on the run itself
pub const MAX_RUN_ERROR_CHARS: usize = 200;

/// Truncates on a char boundary, never splitting a multi-byte character
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
