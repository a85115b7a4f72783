pub mod checkpoint;
pub mod engine;
pub mod event;

pub use checkpoint::{rebuild_from_checkpoint, should_checkpoint, Checkpoint, CheckpointManager};
pub use engine::{
    check_convergence, idempotency_check, replay, replay_with_cancel, select_final_events,
    BatchOutcome, ReplayEngine, ReplayStats,
};
pub use event::{Event, Payload, ReplayedState};
