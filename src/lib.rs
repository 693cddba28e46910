// Library surface shared by the binary and the integration tests.
pub mod app_dirs;
pub mod composition;
pub mod config;
pub mod error;
pub mod experiments;
pub mod gaze;
pub mod quota;
pub mod runtime;
pub mod session;
pub mod store;
pub mod util;

pub use error::{Error, Result};
