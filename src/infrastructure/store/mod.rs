pub mod memory_store;

pub use memory_store::{MemoryStatusStore, WriteEntry, WriteOp};
