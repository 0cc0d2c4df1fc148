mod inventory;
mod library;

pub use inventory::*;
pub use library::*;
