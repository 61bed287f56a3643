mod conversation;
mod retry;

pub use conversation::{ConversationEvent, InputMode, Orchestrator, RejectReason, SendOutcome};
pub use retry::{RetryController, RetryPolicy};
