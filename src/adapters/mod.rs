mod memory;

pub use memory::{MemoryCheckpointStore, MemoryNotary, MemoryVault};
