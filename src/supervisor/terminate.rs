use futures::future::BoxFuture;

/// Backend-specific teardown run once when the job starts shutting down,
/// after every local worker has been sent its termination notice.
pub trait Terminate: Send + Sync {
    fn terminate(&self) -> BoxFuture<'_, ()>;
}

/// Teardown for backends whose workers are all local.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTerminate;

impl Terminate for NoopTerminate {
    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
