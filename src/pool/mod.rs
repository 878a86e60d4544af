pub mod manager;
pub mod model;
pub mod stats;

pub use manager::Pool;
pub use model::{BoundModel, Model, WatchHandle};
pub use stats::{ConnectionStat, PoolStats};
