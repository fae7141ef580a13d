pub mod ingest;
pub mod queue;
pub mod sequencer;
pub mod worker;

pub use ingest::*;
pub use queue::*;
pub use sequencer::*;
pub use worker::*;
