use std::path::PathBuf;

use crate::{config, fsutil, grpc, introspection, netns};

/// Errors that stop the device plugin.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error("failed to create placeholder device: {0}")]
    PlaceholderDevice(#[source] fsutil::Error),
    #[error("failed to connect to containerd: {0}")]
    Containerd(#[from] introspection::ConnectError),
    #[error(transparent)]
    Listen(#[from] grpc::ListenError),
    #[error("device plugin server failed: {0}")]
    Serve(#[source] tonic::transport::Error),
    #[error("failed to connect to kubelet socket `{path}`: {source}")]
    KubeletConnect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("failed to register with kubelet: {0}")]
    Register(#[source] Box<tonic::Status>),
    #[error("fatal error while attaching device `{device_id}`: {source}")]
    FatalAttachment {
        device_id: String,
        #[source]
        source: netns::Error,
    },
    #[error("{task} task panicked")]
    TaskPanicked { task: &'static str },
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

pub trait ResultOkLogExt<T, E> {
    fn ok_log(self) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }
}
