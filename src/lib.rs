pub mod agent;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use error::{ForemanError, Result};
