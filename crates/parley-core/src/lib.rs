pub mod batcher;
pub mod fakes;
pub mod reconstruct;
pub mod traits;
pub mod types;

pub use batcher::{BatcherConfig, CoalescingScheduler};
pub use reconstruct::{TurnReconstructor, partition_turns};
pub use traits::*;
pub use types::*;
