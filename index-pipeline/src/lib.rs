#![allow(clippy::missing_docs_in_private_items)]

pub mod chunker;
pub mod graph;
pub mod loader;
pub mod pipeline;

pub use pipeline::{BuildOutcome, BuildPhase, BuildProgress, BuildReport, IndexPipeline};
