#![allow(clippy::missing_docs_in_private_items)]

pub mod events;
pub mod miner;
pub mod promote;
pub mod trainer;

pub use events::{UsageEvent, UsageEventLog};
pub use miner::{mine_triplets, resolve_triplets, ResolvedTriplet, Triplet};
pub use promote::{promote, PromoteOutcome};
pub use trainer::{AdapterTrainer, BaseScorer, TrainMetrics, TrainerOutput};
