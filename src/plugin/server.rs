use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tonic::transport::Server;

use super::service::DevicePluginService;
use crate::config::{API_VERSION, Config};
use crate::deviceplugin::v1beta1::RegisterRequest;
use crate::deviceplugin::v1beta1::device_plugin_server::DevicePluginServer;
use crate::deviceplugin::v1beta1::registration_client::RegistrationClient;
use crate::error::{Error, ResultOkLogExt};

/// How often the plugin socket is checked for removal by a restarting kubelet.
const SOCKET_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// How long a server may take to drain its connections once asked to stop.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves `service` on the plugin socket and registers it with the kubelet.
///
/// A restarting kubelet removes every plugin socket. Whenever the socket disappears, the
/// server is restarted on a fresh socket and registered again. The server stops once
/// `shutdown` turns `true` and removes its socket afterwards.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or the kubelet rejects the first
/// registration. Errors of the running server are reported through the returned handle.
pub async fn serve(
    config: &Config,
    service: DevicePluginService,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<Result<(), Error>>, Error> {
    serve_with_check_interval(config, service, shutdown, SOCKET_CHECK_INTERVAL).await
}

async fn serve_with_check_interval(
    config: &Config,
    service: DevicePluginService,
    shutdown: watch::Receiver<bool>,
    check_interval: Duration,
) -> Result<JoinHandle<Result<(), Error>>, Error> {
    let generation = Generation::start(config, service.clone()).await?;
    let supervisor = Supervisor {
        config: config.clone(),
        service,
        shutdown,
        check: tokio::time::interval(check_interval),
    };

    Ok(tokio::spawn(supervisor.run(generation)))
}

/// One registered server instance bound to the plugin socket.
struct Generation {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), Error>>,
}

impl Generation {
    async fn start(config: &Config, service: DevicePluginService) -> Result<Self, Error> {
        let incoming = crate::grpc::bind_unix_listener(config.plugin_socket())?;
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = stopped.await;
                })
                .await
                .map_err(Error::Serve)
        });

        if let Err(err) = register(config).await {
            handle.abort();
            return Err(err);
        }

        Ok(Self {
            stop: Some(stop),
            handle,
        })
    }

    /// Stops the server, aborting it if it does not drain in time.
    async fn stop(&mut self) -> Result<(), Error> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut self.handle).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                log::warn!("Device plugin server did not drain in time");
                self.handle.abort();
                Ok(())
            }
        }
    }
}

struct Supervisor {
    config: Config,
    service: DevicePluginService,
    shutdown: watch::Receiver<bool>,
    check: Interval,
}

impl Supervisor {
    async fn run(mut self, mut generation: Generation) -> Result<(), Error> {
        self.check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let socket = self.config.plugin_socket();

        let result = loop {
            tokio::select! {
                _ = stop_requested(&mut self.shutdown) => break generation.stop().await,
                joined = &mut generation.handle => break flatten(joined),
                _ = self.check.tick() => {
                    if socket.exists() {
                        continue;
                    }
                    log::warn!(
                        "Plugin socket {} was removed, re-registering with the kubelet",
                        socket.display()
                    );
                    generation.stop().await.ok_log();
                    match self.restart().await {
                        Some(restarted) => generation = restarted,
                        None => break Ok(()),
                    }
                }
            }
        };

        log::info!("Device plugin server stopped");
        std::fs::remove_file(&socket).ok_log();
        result
    }

    /// Retries serving and registering until it succeeds. Returns `None` on shutdown.
    async fn restart(&mut self) -> Option<Generation> {
        loop {
            match Generation::start(&self.config, self.service.clone()).await {
                Ok(generation) => {
                    log::info!("Re-registered with the kubelet");
                    return Some(generation);
                }
                Err(err) => log::warn!("Re-registration failed, will retry: {err}"),
            }
            tokio::select! {
                _ = stop_requested(&mut self.shutdown) => return None,
                _ = self.check.tick() => {}
            }
        }
    }
}

fn flatten(joined: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    joined.unwrap_or(Err(Error::TaskPanicked {
        task: "device plugin server",
    }))
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // Either a value was sent or the sender is gone; both mean stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Announces the plugin to the kubelet, which then connects back to the plugin socket.
async fn register(config: &Config) -> Result<(), Error> {
    let kubelet_socket = config.kubelet_socket();
    let channel = crate::grpc::channel_for_unix_socket(&kubelet_socket)
        .await
        .map_err(|source| Error::KubeletConnect {
            path: kubelet_socket.clone(),
            source,
        })?;

    let request = RegisterRequest {
        version: API_VERSION.to_owned(),
        endpoint: config.plugin_endpoint(),
        resource_name: config.resource_name(),
        options: Some(DevicePluginService::options()),
    };
    log::info!(
        "Registering resource `{}` at endpoint `{}`",
        request.resource_name,
        request.endpoint
    );
    RegistrationClient::new(channel)
        .register(request)
        .await
        .map_err(|err| Error::Register(Box::new(err)))?;

    Ok(())
}
