mod queue_db;

pub use queue_db::*;
