pub mod config;
pub mod handlers;
pub mod health;
pub mod models;
pub mod processing;
pub mod provision;
pub mod stats;
pub mod storage;
pub mod thumbnails;

// Convenient re-exports for tests and external callers
pub use config::*;
pub use handlers::*;
pub use health::*;
pub use models::*;
pub use provision::*;
pub use stats::*;
pub use storage::*;
pub use thumbnails::*;
