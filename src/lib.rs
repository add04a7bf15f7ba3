//! SocketCAN device plugin: advertises a pool of virtual CAN devices to the kubelet and,
//! once a device is allocated, creates a `vcan` interface inside the network namespace of
//! the container that received it.
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use allocation::{Dispatcher, RetryPolicy};
use config::Config;
use error::{Error, ResultOkLogExt};
use introspection::ContainerdIntrospector;
use netns::{LinuxNetns, ThreadAttacher};
use plugin::{DevicePluginService, Inventory};

pub mod allocation;
pub mod config;
pub mod container;
pub mod error;
pub mod fsutil;
pub mod grpc;
pub mod introspection;
pub mod netns;
pub mod plugin;

pub mod deviceplugin {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");
    }
}

pub mod containerd {
    pub mod v1 {
        pub mod types {
            tonic::include_proto!("containerd.v1.types");
        }
    }
    pub mod services {
        pub mod containers {
            pub mod v1 {
                tonic::include_proto!("containerd.services.containers.v1");
            }
        }
        pub mod tasks {
            pub mod v1 {
                tonic::include_proto!("containerd.services.tasks.v1");
            }
        }
    }
}

/// How long the plugin may take to wind down its tasks after a shutdown was requested.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the device plugin until it is signalled to stop or a fatal error occurs.
///
/// # Errors
///
/// Possible errors include:
/// - Invalid configuration in the environment.
/// - The containerd socket cannot be connected.
/// - The placeholder device cannot be created.
/// - The plugin socket cannot be bound or the kubelet rejects the registration.
/// - An attachment left its thread in an unknown network namespace.
pub async fn run() -> Result<(), Error> {
    let config = Config::from_env()?;
    log::debug!("Configuration: {:?}", config);

    let introspector =
        ContainerdIntrospector::connect(&config.containerd_socket, &config.containerd_namespace)
            .await?;
    let attacher = ThreadAttacher::new(LinuxNetns, config::INTERFACE_NAME);
    let policy = RetryPolicy {
        attempts: config.retries,
        backoff_unit: config.backoff_unit,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (allocation_tx, allocation_rx) = allocation::channel();
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let summary_handle = tokio::spawn(allocation::summarize(reports_rx));
    let dispatcher =
        Dispatcher::new(allocation_rx, introspector, attacher, policy).with_reports(reports_tx);
    let mut dispatcher_handle =
        plugin::start(&config.placeholder_device, dispatcher, shutdown_rx.clone())?;

    let inventory = Inventory::generate(config.pool_size);
    log::info!("Generated {} vcan devices", inventory.len());
    let service = DevicePluginService::new(
        inventory,
        config.placeholder_device.to_string_lossy(),
        allocation_tx,
    );
    let mut server_handle = plugin::serve(&config, service, shutdown_rx).await?;
    log::info!("Device plugin `{}` is running", config.resource_name());

    let mut dispatcher_done = false;
    let mut server_done = false;
    let result = tokio::select! {
        signal = shutdown_signal() => {
            signal.map(|signal| log::info!("Received {signal}, shutting down"))
        }
        result = &mut dispatcher_handle => {
            dispatcher_done = true;
            join_result(result, "allocation dispatcher")
        }
        result = &mut server_handle => {
            server_done = true;
            join_result(result, "device plugin server")
        }
    };

    shutdown_tx.send(true).ok_log();
    let wind_down = async {
        if !dispatcher_done {
            join_result(dispatcher_handle.await, "allocation dispatcher").ok_log();
        }
        if !server_done {
            join_result(server_handle.await, "device plugin server").ok_log();
        }
        if let Ok(summary) = summary_handle.await {
            log::info!(
                "Handled {} allocations: {} attached, {} abandoned",
                summary.attached + summary.abandoned,
                summary.attached,
                summary.abandoned
            );
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, wind_down).await.is_err() {
        log::warn!("Tasks did not stop in time");
    }

    result
}

async fn shutdown_signal() -> Result<&'static str, Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).map_err(Error::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(Error::Signal)?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}

fn join_result(
    result: Result<Result<(), Error>, tokio::task::JoinError>,
    task: &'static str,
) -> Result<(), Error> {
    match result {
        Ok(result) => {
            log::info!("{task} stopped");
            result
        }
        Err(err) => {
            log::error!("{task} did not finish: {err}");
            Err(Error::TaskPanicked { task })
        }
    }
}
