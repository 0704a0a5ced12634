//! Repository implementations for database operations

pub mod daily_stats;
pub mod engine_state;
pub mod rounds;
pub mod signals;

pub use daily_stats::*;
pub use engine_state::*;
pub use rounds::*;
pub use signals::*;
