use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use super::inventory::{Inventory, device_container_path};
use crate::allocation::{self, Allocation};
use crate::deviceplugin::v1beta1::device_plugin_server::DevicePlugin;
use crate::deviceplugin::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, DevicePluginOptions,
    DeviceSpec, Empty, ListAndWatchResponse, PreStartContainerRequest,
    PreStartContainerResponse, PreferredAllocationRequest, PreferredAllocationResponse,
};

/// Cgroup permissions of the placeholder device inside the container.
const DEVICE_PERMISSIONS: &str = "r";

/// The device plugin as seen by the kubelet.
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    inventory: Arc<Inventory>,
    host_path: String,
    allocations: allocation::Sender,
}

impl DevicePluginService {
    /// `host_path` is the placeholder device bound to every allocated device.
    pub fn new(
        inventory: Inventory,
        host_path: impl Into<String>,
        allocations: allocation::Sender,
    ) -> Self {
        Self {
            inventory: Arc::new(inventory),
            host_path: host_path.into(),
            allocations,
        }
    }

    /// Options advertised to the kubelet, at registration and on request.
    pub fn options() -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(Self::options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + 'static>>;

    /// Sends the device list once and then keeps the stream open; device health never changes.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        log::debug!("Advertising {} devices", self.inventory.len());
        let response = ListAndWatchResponse {
            devices: self.inventory.devices().to_vec(),
        };
        let stream = tokio_stream::once(Ok(response)).chain(tokio_stream::pending());

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    /// Binds the placeholder device into the container once per requested device and queues
    /// each device for interface attachment. Returns without waiting for the attachment.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        let mut response = AllocateResponse::default();

        for container_request in request.container_requests {
            let mut devices = Vec::with_capacity(container_request.devices_ids.len());
            for device_id in container_request.devices_ids {
                let container_path = device_container_path(&device_id);
                devices.push(DeviceSpec {
                    container_path: container_path.clone(),
                    host_path: self.host_path.clone(),
                    permissions: DEVICE_PERMISSIONS.to_owned(),
                });

                log::debug!("Queueing allocation of device `{}`", device_id);
                self.allocations
                    .send(Allocation {
                        device_id,
                        container_path,
                    })
                    .await
                    .map_err(|_| Status::unavailable("allocation dispatcher is not running"))?;
            }
            response.container_responses.push(ContainerAllocateResponse {
                devices,
                ..Default::default()
            });
        }

        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
