//! Structural event sink for index observability.

/// Receiver for index structural events. Injected at construction; every
/// method has a no-op default so sinks implement only what they need.
pub trait MetricsSink: Send + Sync {
    /// A bucket split moved entries into `file_level`.
    fn on_bucket_split(&self, file_level: usize) {
        let _ = file_level;
    }

    /// A bucket merge drained a pair at `file_level`.
    fn on_bucket_merge(&self, file_level: usize) {
        let _ = file_level;
    }

    /// A directory node doubled its fanout.
    fn on_node_split(&self) {}

    /// A directory node collapsed into its parent.
    fn on_node_merge(&self) {}

    /// The split buffer flushed `pages` staged pages.
    fn on_split_buffer_drain(&self, pages: usize) {
        let _ = pages;
    }
}

/// Sink that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
