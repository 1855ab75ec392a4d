use tracing::info;

/// Events the engine emits. Channel adapters (desktop, Slack, ...) live
/// outside the core and subscribe through the `Notifier` trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    PipelineStarted,
    StageCompleted,
    StageFailed,
    PrCreated,
    PipelineCompleted,
    PipelineFailed,
}

impl NotifyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::PrCreated => "pr.created",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub kind: NotifyKind,
    pub pipeline: String,
    pub run_id: String,
    pub detail: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotifyEvent);
}

/// Default sink: one structured log line per event.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotifyEvent) {
        info!(
            kind = event.kind.as_str(),
            pipeline = %event.pipeline,
            run_id = %event.run_id,
            "{}",
            event.detail
        );
    }
}

/// Drops everything; for tests and dry runs.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &NotifyEvent) {}
}
