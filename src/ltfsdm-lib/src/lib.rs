mod attrs;
mod comm;
mod config;
mod error;
mod message;
mod types;

pub use attrs::*;
pub use comm::*;
pub use config::*;
pub use error::*;
pub use message::*;
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
