// Utility functions
pub mod sanitize;
pub mod validation;

pub use sanitize::{screen_text, ContentFinding};
pub use validation::{validate_path, validate_url};
