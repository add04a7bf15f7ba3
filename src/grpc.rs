//! gRPC over unix domain sockets, for both the client and the server side.
use std::io;
use std::path::{Path, PathBuf};
use std::{pin, task};

use hyper_util::rt::TokioIo;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl tower::Service<hyper::Uri> for UnixConnector {
    type Response = TokioIo<tokio::net::UnixStream>;

    type Error = io::Error;

    type Future = pin::Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;

            Ok(TokioIo::new(stream))
        })
    }
}

/// Opens a gRPC channel to the server listening on the unix socket at `path`.
///
/// # Errors
///
/// Returns the transport error if the socket cannot be connected.
pub async fn channel_for_unix_socket(
    path: impl AsRef<Path>,
) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref();
    log::debug!("Connecting to {}...", path.display());
    let connector = UnixConnector {
        path: path.to_path_buf(),
    };
    // The authority is ignored by the connector; tonic only needs a valid URI.
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(connector)
        .await?;
    log::debug!("Created channel for {}.", path.display());

    Ok(channel)
}

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("failed to remove stale socket `{path}`: {source}")]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind socket `{path}`: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Binds a unix socket listener at `path`, replacing a socket left over by a previous run.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns [`ListenError`] if the stale socket cannot be removed or the new one cannot be bound.
pub fn bind_unix_listener(path: impl AsRef<Path>) -> Result<UnixListenerStream, ListenError> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed stale socket {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ListenError::RemoveStale {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    let listener = tokio::net::UnixListener::bind(path).map_err(|source| ListenError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Listening on {}", path.display());

    Ok(UnixListenerStream::new(listener))
}
