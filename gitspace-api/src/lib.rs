//! HTTP surface and process wiring of the gitspace engine.

pub mod api_docs;
pub mod config;
pub mod engine;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use engine::Engine;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
