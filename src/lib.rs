pub mod api;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod messaging;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export main components for easier use
pub use config::{load_config, Config};
pub use error::Error;
pub use messaging::{ChangeEvent, EventType, RealtimeDistributor, TableFilter};
pub use services::Pipeline;
