//! The kubelet-facing device plugin: device inventory, gRPC service, lifecycle and server.
use std::path::Path;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::allocation::Dispatcher;
use crate::error::Error;
use crate::fsutil::{self, Placeholder};
use crate::introspection::ContainerIntrospector;
use crate::netns::Attacher;

mod inventory;
mod server;
mod service;

pub use inventory::{DEVICE_ID_PREFIX, Health, Inventory, device_container_path};
pub use server::serve;
pub use service::DevicePluginService;

/// Start hook of the plugin.
///
/// Makes sure the placeholder device exists on the host and launches the allocation
/// dispatcher. The returned handle completes when the dispatcher stops; a fatal attachment
/// error is reported through it.
///
/// # Errors
///
/// Returns [`Error::PlaceholderDevice`] if the placeholder device does not exist and cannot be
/// created. Without it no device of the pool is usable, so the plugin must not continue.
pub fn start<I, A>(
    placeholder: &Path,
    dispatcher: Dispatcher<I, A>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<Result<(), Error>>, Error>
where
    I: ContainerIntrospector + 'static,
    A: Attacher + 'static,
{
    match fsutil::ensure_placeholder_device(placeholder).map_err(Error::PlaceholderDevice)? {
        Placeholder::AlreadyPresent => {
            log::debug!("Using existing placeholder device {}", placeholder.display())
        }
        Placeholder::Created => {
            log::info!("Created placeholder device {}", placeholder.display())
        }
    }

    Ok(tokio::spawn(dispatcher.run(shutdown)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{self, RetryPolicy};
    use crate::container::ContainerID;
    use crate::{introspection, netns};

    struct NoContainers;

    impl ContainerIntrospector for NoContainers {
        async fn container_id_by_device(&self, path: &str) -> introspection::Result<ContainerID> {
            Err(introspection::Error::DeviceNotMounted {
                path: path.to_owned(),
            })
        }

        async fn pid_by_container_id(&self, id: &ContainerID) -> introspection::Result<u32> {
            Err(introspection::Error::NotRunning { id: id.clone() })
        }
    }

    struct NeverCalled;

    impl Attacher for NeverCalled {
        async fn attach(&self, _pid: u32) -> netns::Result<()> {
            unreachable!("no container is ever resolved")
        }
    }

    fn dispatcher() -> (allocation::Sender, Dispatcher<NoContainers, NeverCalled>) {
        let (tx, rx) = allocation::channel();
        let dispatcher = Dispatcher::new(rx, NoContainers, NeverCalled, RetryPolicy::default());
        (tx, dispatcher)
    }

    #[tokio::test]
    async fn test_start_with_existing_placeholder() {
        let placeholder = tempfile::NamedTempFile::new().unwrap();
        let (tx, dispatcher) = dispatcher();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = start(placeholder.path(), dispatcher, shutdown_rx).expect("start");
        drop(tx);
        handle.await.unwrap().expect("dispatcher should exit once the queue closes");
    }

    #[tokio::test]
    async fn test_start_fails_when_placeholder_cannot_be_created() {
        let (tx, dispatcher) = dispatcher();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = start(
            Path::new("/definitely/does/not/exist/fakedev"),
            dispatcher,
            shutdown_rx,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::PlaceholderDevice(fsutil::Error::CreateDevice { .. })
        ));
        // The dispatcher was never launched, so the queue has no consumer.
        assert!(tx.send(allocation_for("vcan-a")).await.is_err());
    }

    fn allocation_for(device_id: &str) -> allocation::Allocation {
        allocation::Allocation {
            device_id: device_id.to_owned(),
            container_path: device_container_path(device_id),
        }
    }
}
