//! Shared vocabulary for the block relay: ids, normalized provider deltas,
//! canonical block events, conversation turns, client wire records, and the
//! collaborator traits the engine is written against.

pub mod blocks;
pub mod broadcast;
pub mod cancel;
pub mod chat;
pub mod delta;
pub mod errors;
pub mod history;
pub mod ids;
pub mod provider;
pub mod session;
pub mod summary;
pub mod tools;
pub mod usage;
pub mod wire;
