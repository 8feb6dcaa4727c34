pub mod checkpoint;
pub mod donations;
pub mod pool;
pub mod schema;

pub use checkpoint::Checkpoint;
pub use donations::{DonationRecord, InsertOutcome};
pub use pool::{create_pool, in_memory, DbPool};
