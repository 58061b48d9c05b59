/// Receives batches whose flush exhausted every retry.
///
/// The pipeline drops such batches after calling the hook; implementations
/// must not block.
pub trait DeadLetterHook<T>: Send + Sync {
    fn on_exhausted(&self, table: &str, batch: &[T], error: &anyhow::Error);
}

/// Default hook: the batch is simply dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDeadLetter;

impl<T> DeadLetterHook<T> for NoopDeadLetter {
    fn on_exhausted(&self, _table: &str, _batch: &[T], _error: &anyhow::Error) {}
}
