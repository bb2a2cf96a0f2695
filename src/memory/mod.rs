//! Durable run memory shared across pipeline runs

mod store;

pub use store::{
    ClearMemoryInput, MemoryRecord, MemoryScope, QueryMemoryInput, RunMemoryStore, SaveMemoryInput,
};
