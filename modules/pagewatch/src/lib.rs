pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod media;
pub mod monitor;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod types;
pub mod url_normalizer;

pub use config::Config;
pub use error::{PagewatchError, Result};
pub use types::*;
