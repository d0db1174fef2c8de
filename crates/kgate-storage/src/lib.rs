pub mod entities;
pub mod memory;
pub mod seaorm;
pub mod storage;

pub use memory::MemoryStorage;
pub use seaorm::SeaOrmStorage;
pub use storage::{Storage, StorageError, StorageResult, SummaryRow};
