//! SQLite-backed implementations of the engine's collaborators.

pub mod broadcast;
pub mod cancel_flags;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod turns;

pub use broadcast::SqliteBroadcastLog;
pub use cancel_flags::SqliteCancellationFlags;
pub use database::Database;
pub use error::StoreError;
pub use sessions::SessionModelRepo;
pub use turns::TurnRepo;
