pub mod poll;
pub mod scheduler;

pub use poll::{poll_assistant_content, poll_two_phase, reconciled_content, PollConfig, ReconciledContent};
pub use scheduler::{PendingSync, SyncConfig, SyncOutcome, TIMEOUT_MESSAGE};
