//! The worker's HTTP surface.
//!
//! - [`routes`]: `/completion`, `/embedding`, `/load`, `/health`, `/info`
//! - [`streaming`]: newline-delimited JSON streaming of completion frames

pub mod routes;
pub mod streaming;

pub use routes::{build_router, AppState};
