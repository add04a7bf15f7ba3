use std::path::{Path, PathBuf};
use std::str::FromStr;

use tonic::metadata::MetadataValue;
use tonic::transport::Channel;

use super::{ContainerIntrospector, Error, Result};
use crate::container::ContainerID;
use crate::containerd::services::containers::v1::ListContainersRequest;
use crate::containerd::services::containers::v1::containers_client::ContainersClient;
use crate::containerd::services::tasks::v1::GetRequest;
use crate::containerd::services::tasks::v1::tasks_client::TasksClient;
use crate::containerd::v1::types::Status;

const NAMESPACE_HEADER: &str = "containerd-namespace";

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid containerd namespace `{0}`")]
    InvalidNamespace(String),
    #[error("failed to connect to socket `{path}`: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Resolves containers through the containerd API.
///
/// A device handed out by the plugin shows up in the container's OCI runtime spec
/// under `linux.devices`, which is how the owning container is found.
#[derive(Debug, Clone)]
pub struct ContainerdIntrospector {
    containers: ContainersClient<Channel>,
    tasks: TasksClient<Channel>,
    namespace: MetadataValue<tonic::metadata::Ascii>,
}

impl ContainerdIntrospector {
    /// Connects to the containerd socket at `socket_path`, scoping every request to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] if the namespace is not a valid header value or the socket
    /// cannot be connected.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        namespace: &str,
    ) -> std::result::Result<Self, ConnectError> {
        let namespace = MetadataValue::from_str(namespace)
            .map_err(|_| ConnectError::InvalidNamespace(namespace.to_owned()))?;
        let socket_path = socket_path.as_ref();
        let channel = crate::grpc::channel_for_unix_socket(socket_path)
            .await
            .map_err(|source| ConnectError::Socket {
                path: socket_path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            containers: ContainersClient::new(channel.clone()),
            tasks: TasksClient::new(channel),
            namespace,
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request
            .metadata_mut()
            .insert(NAMESPACE_HEADER, self.namespace.clone());
        request
    }
}

impl ContainerIntrospector for ContainerdIntrospector {
    async fn container_id_by_device(&self, path: &str) -> Result<ContainerID> {
        let mut client = self.containers.clone();
        let containers = client
            .list(self.request(ListContainersRequest {
                filters: Vec::default(),
            }))
            .await
            .map_err(|err| Error::ListContainers(Box::new(err)))?
            .into_inner()
            .containers;
        log::trace!("Searching {} containers for device `{}`", containers.len(), path);

        for container in containers {
            let Some(spec) = container.spec else {
                continue;
            };
            match spec_has_device(&spec.value, path) {
                Ok(true) => match ContainerID::new(&container.id) {
                    Ok(id) => return Ok(id),
                    Err(err) => log::warn!("Skipping container with invalid id: {}", err),
                },
                Ok(false) => {}
                Err(err) => log::debug!(
                    "Skipping container `{}` with undecodable runtime spec: {}",
                    container.id,
                    err
                ),
            }
        }

        Err(Error::DeviceNotMounted {
            path: path.to_owned(),
        })
    }

    async fn pid_by_container_id(&self, id: &ContainerID) -> Result<u32> {
        let mut client = self.tasks.clone();
        let process = client
            .get(self.request(GetRequest {
                container_id: id.as_str().to_owned(),
                exec_id: String::new(),
            }))
            .await
            .map_err(|err| Error::GetTask {
                id: id.clone(),
                source: Box::new(err),
            })?
            .into_inner()
            .process;

        match process {
            Some(process) if process.status() == Status::Running && process.pid != 0 => {
                Ok(process.pid)
            }
            _ => Err(Error::NotRunning { id: id.clone() }),
        }
    }
}

/// The parts of an OCI runtime spec needed to find a device.
#[derive(Debug, Default, serde::Deserialize)]
struct RuntimeSpec {
    #[serde(default)]
    linux: Option<LinuxSpec>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct LinuxSpec {
    #[serde(default)]
    devices: Vec<LinuxDevice>,
}

#[derive(Debug, serde::Deserialize)]
struct LinuxDevice {
    path: String,
}

/// Returns whether the JSON encoded OCI runtime spec lists a device at `path`.
fn spec_has_device(spec: &[u8], path: &str) -> serde_json::Result<bool> {
    let spec: RuntimeSpec = serde_json::from_slice(spec)?;
    Ok(spec
        .linux
        .is_some_and(|linux| linux.devices.iter().any(|device| device.path == path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: &str = "/tmp/device-plugin-socketcan/vcan-1234";

    #[test]
    fn test_spec_has_device_match() {
        let spec = format!(
            r#"{{"ociVersion":"1.1.0","linux":{{"devices":[
                {{"path":"/dev/fuse","type":"c","major":10,"minor":229}},
                {{"path":"{DEVICE}","type":"b","major":1,"minor":1}}
            ]}}}}"#
        );
        assert!(spec_has_device(spec.as_bytes(), DEVICE).unwrap());
    }

    #[test]
    fn test_spec_has_device_no_match() {
        let spec = r#"{"linux":{"devices":[{"path":"/dev/fuse","type":"c"}]}}"#;
        assert!(!spec_has_device(spec.as_bytes(), DEVICE).unwrap());

        let without_devices = r#"{"linux":{"namespaces":[]}}"#;
        assert!(!spec_has_device(without_devices.as_bytes(), DEVICE).unwrap());

        let without_linux = r#"{"ociVersion":"1.1.0"}"#;
        assert!(!spec_has_device(without_linux.as_bytes(), DEVICE).unwrap());
    }

    #[test]
    fn test_spec_has_device_invalid_json() {
        assert!(spec_has_device(b"not json", DEVICE).is_err());
    }
}
