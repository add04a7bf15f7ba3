//! Maps the container-side path of an allocated device to the container that
//! received it and to that container's init process.
use crate::container::ContainerID;

pub mod containerd;

pub use containerd::{ConnectError, ContainerdIntrospector};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no container has device `{path}` mounted")]
    DeviceNotMounted { path: String },
    #[error("container `{id}` has no running task")]
    NotRunning { id: ContainerID },
    #[error("failed to list containers: {0}")]
    ListContainers(#[source] Box<tonic::Status>),
    #[error("failed to get task of container `{id}`: {source}")]
    GetTask {
        id: ContainerID,
        #[source]
        source: Box<tonic::Status>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Container runtime lookups needed to attach an interface to a container.
///
/// Both lookups fail while the container does not exist yet, so callers are
/// expected to retry.
pub trait ContainerIntrospector: Send + Sync {
    /// Finds the container that has the device at `path` (container side) mounted.
    fn container_id_by_device(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<ContainerID>> + Send;

    /// Returns the host PID of the init process of `id`.
    fn pid_by_container_id(&self, id: &ContainerID) -> impl Future<Output = Result<u32>> + Send;
}
