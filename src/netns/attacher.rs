use std::sync::Arc;

use super::{Error, LinkOps, NamespaceOps, Result, attach_vcan};

/// Attaches the vcan interface to the network namespace of a process.
pub trait Attacher: Send + Sync {
    fn attach(&self, pid: u32) -> impl Future<Output = Result<()>> + Send;
}

/// Runs every attachment on its own, freshly spawned OS thread.
///
/// Namespace switches only ever affect that thread, so they cannot leak into the
/// async runtime's worker threads, and a thread that failed to switch back dies with
/// the attempt instead of being reused.
#[derive(Debug)]
pub struct ThreadAttacher<B> {
    backend: Arc<B>,
    interface: String,
}

impl<B> ThreadAttacher<B> {
    pub fn new(backend: B, interface: impl Into<String>) -> Self {
        Self {
            backend: Arc::new(backend),
            interface: interface.into(),
        }
    }
}

impl<B> Attacher for ThreadAttacher<B>
where
    B: NamespaceOps + LinkOps + Send + Sync + 'static,
{
    async fn attach(&self, pid: u32) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let backend = Arc::clone(&self.backend);
        let interface = self.interface.clone();

        std::thread::Builder::new()
            .name(format!("attach-{pid}"))
            .spawn(move || {
                let result = attach_vcan(backend.as_ref(), pid, &interface);
                // The receiver is gone only if the dispatcher was shut down mid-attempt.
                let _ = tx.send(result);
            })
            .map_err(Error::SpawnThread)?;

        rx.await.map_err(|_| Error::WorkerLost)?
    }
}
