pub mod batch;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;

// Platform API access
pub mod github;

// Discovery, manifests and metadata
pub mod manifest;
pub mod metadata;
pub mod search;

// One full scan cycle
pub mod scan;

// Operator CLI
pub mod cli;

// Utilities
pub mod utils;

// Re-exports
pub use cancel::{CancelHandle, Cancellation};
pub use config::Settings;
pub use error::{Error, Result};
pub use scan::{ScanReport, ScanRunner};
