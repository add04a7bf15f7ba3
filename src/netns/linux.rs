use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo};
use nix::sched::{CloneFlags, setns};
use rtnetlink::Handle;

use super::{Error, LinkOps, NamespaceOps, Result};

const VCAN_KIND: &str = "vcan";

/// Open file descriptor of a `/proc/.../ns/net` entry.
#[derive(Debug)]
pub struct NamespaceFd {
    fd: OwnedFd,
    path: PathBuf,
}

impl NamespaceFd {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::OpenNamespace {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            fd: file.into(),
            path: path.to_path_buf(),
        })
    }
}

/// Namespace and link operations backed by `setns(2)` and rtnetlink.
///
/// Every link operation opens its own netlink socket, which binds to the namespace the
/// calling thread is in at that moment.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxNetns;

impl NamespaceOps for LinuxNetns {
    type Handle = NamespaceFd;

    fn current(&self) -> Result<NamespaceFd> {
        NamespaceFd::open("/proc/thread-self/ns/net")
    }

    fn for_pid(&self, pid: u32) -> Result<NamespaceFd> {
        NamespaceFd::open(format!("/proc/{pid}/ns/net"))
    }

    fn enter(&self, handle: &NamespaceFd) -> Result<()> {
        setns(&handle.fd, CloneFlags::CLONE_NEWNET).map_err(Error::EnterNamespace)?;
        log::trace!("Entered network namespace {}", handle.path.display());
        Ok(())
    }
}

impl LinkOps for LinuxNetns {
    fn add_vcan(&self, name: &str) -> Result<()> {
        with_netlink(|handle| async move {
            let mut request = handle.link().add().name(name.to_owned());
            request
                .message_mut()
                .attributes
                .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(
                    InfoKind::Other(VCAN_KIND.to_owned()),
                )]));
            request.execute().await.map_err(|source| Error::AddLink {
                name: name.to_owned(),
                source,
            })
        })
    }

    fn set_up(&self, name: &str) -> Result<()> {
        with_netlink(|handle| async move {
            let index = link_index(&handle, name).await?;
            handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|source| Error::SetUp {
                    name: name.to_owned(),
                    source,
                })
        })
    }

    fn delete(&self, name: &str) -> Result<()> {
        with_netlink(|handle| async move {
            let index = link_index(&handle, name).await?;
            handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|source| Error::DeleteLink {
                    name: name.to_owned(),
                    source,
                })
        })
    }
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    let mut links = std::pin::pin!(handle.link().get().match_name(name.to_owned()).execute());
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(Error::LinkNotFound {
            name: name.to_owned(),
        }),
        Err(source) => Err(Error::LookupLink {
            name: name.to_owned(),
            source,
        }),
    }
}

/// Runs `op` against a fresh rtnetlink connection on a single threaded runtime.
///
/// Must not be called from within an async context.
fn with_netlink<F, Fut, T>(op: F) -> Result<T>
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(Error::Runtime)?;

    runtime.block_on(async move {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(Error::NetlinkConnection)?;
        let connection = tokio::spawn(connection);
        let result = op(handle).await;
        connection.abort();
        result
    })
}
