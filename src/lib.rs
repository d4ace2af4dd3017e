pub mod csv;
pub mod engine;
pub mod model;
pub mod points;
pub mod store;

pub use engine::{Engine, EngineError};
pub use model::{AccountId, Command, TransferRequest, TransferStatus};
pub use points::Points;
pub use store::{MemoryStore, Store};
