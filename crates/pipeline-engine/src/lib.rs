pub mod context;
pub mod executor;
pub mod finalize;
pub mod init;
pub mod loop_exec;
pub mod notify;
pub mod orchestrator;
pub mod parallel;
pub mod preflight;

pub use notify::{LogNotifier, Notifier, NotifyEvent, NotifyKind, NullNotifier};
pub use orchestrator::Orchestrator;
