//! Network namespace switching and vcan link management.
//!
//! The current network namespace is per OS thread. Everything in here that
//! switches namespaces must therefore run on a thread that is not shared with
//! unrelated work, see [`ThreadAttacher`].
use std::io;
use std::path::PathBuf;

mod attach;
mod attacher;
mod linux;

pub use attach::attach_vcan;
pub use attacher::{Attacher, ThreadAttacher};
pub use linux::{LinuxNetns, NamespaceFd};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open network namespace `{path}`: {source}")]
    OpenNamespace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to enter network namespace: {0}")]
    EnterNamespace(#[source] nix::Error),
    #[error("failed to restore original network namespace: {source}")]
    RestoreNamespace {
        #[source]
        source: Box<Error>,
    },
    #[error("failed to create netlink runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("failed to open netlink connection: {0}")]
    NetlinkConnection(#[source] io::Error),
    #[error("failed to add link `{name}`: {source}")]
    AddLink {
        name: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("failed to set link `{name}` up: {source}")]
    SetUp {
        name: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("failed to delete link `{name}`: {source}")]
    DeleteLink {
        name: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("failed to look up link `{name}`: {source}")]
    LookupLink {
        name: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("link `{name}` does not exist")]
    LinkNotFound { name: String },
    #[error("failed to spawn attachment thread: {0}")]
    SpawnThread(#[source] io::Error),
    #[error("attachment thread exited without reporting a result")]
    WorkerLost,
}

impl Error {
    /// Whether the thread that produced this error can no longer be trusted to be in
    /// its original network namespace.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RestoreNamespace { .. } | Error::WorkerLost)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Switching of the calling thread's network namespace.
pub trait NamespaceOps {
    type Handle;

    /// Returns a handle to the namespace the calling thread is in.
    fn current(&self) -> Result<Self::Handle>;

    /// Returns a handle to the network namespace of process `pid`.
    fn for_pid(&self, pid: u32) -> Result<Self::Handle>;

    /// Moves the calling thread into `handle`.
    fn enter(&self, handle: &Self::Handle) -> Result<()>;
}

/// Link management inside the calling thread's current network namespace.
pub trait LinkOps {
    fn add_vcan(&self, name: &str) -> Result<()>;

    fn set_up(&self, name: &str) -> Result<()>;

    fn delete(&self, name: &str) -> Result<()>;
}
