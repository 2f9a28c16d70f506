pub mod fetcher;
pub mod models;
pub mod validator;

pub use fetcher::ManifestFetcher;
pub use models::{ManifestKind, ManifestOutcome, ParsedManifest, RawManifestContent, ValidationReport};
pub use validator::ManifestValidator;
