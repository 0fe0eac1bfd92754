//! Round orchestration for the block relay: accumulating normalized block
//! events into turns, publishing wire records, cooperative cancellation, and
//! the tool invocation loop that spans rounds.

pub mod accumulator;
pub mod cancellation;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod reader;
pub mod round;
pub mod summary;

pub use accumulator::{Accumulated, ConversationAccumulator};
pub use cancellation::{CancellationMonitor, MonitorConfig, MonitorGuard};
pub use coordinator::{CoordinatorConfig, QueryHandle, QueryRequest, RoundState, SwitchReason, ToolLoopCoordinator};
pub use error::EngineError;
pub use reader::{LogReader, ReaderConfig};
pub use summary::{ModelSummarizer, SummaryTask};
