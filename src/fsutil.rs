use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::{Mode, SFlag, makedev, mknod};

/// Major number of the placeholder block device.
pub const PLACEHOLDER_MAJOR: u64 = 1;
/// Minor number of the placeholder block device.
pub const PLACEHOLDER_MINOR: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to check if path `{path}` exists: {source}")]
    ExistenceCheck {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create block device `{path}` ({major}:{minor}): {source}")]
    CreateDevice {
        path: PathBuf,
        major: u64,
        minor: u64,
        #[source]
        source: nix::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// What [`ensure_placeholder_device`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    AlreadyPresent,
    Created,
}

/// Creates a block device node with the given major/minor numbers.
///
/// Requires `CAP_MKNOD`.
///
/// # Errors
///
/// Returns [`Error::CreateDevice`] if the `mknod(2)` call fails.
fn create_block_device(path: impl AsRef<Path>, major: u64, minor: u64) -> Result<()> {
    let path = path.as_ref();
    mknod(
        path,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o666),
        makedev(major, minor),
    )
    .map_err(|source| Error::CreateDevice {
        path: path.to_path_buf(),
        major,
        minor,
        source,
    })
}

/// Makes sure the placeholder device every allocation points at exists on the host.
///
/// Idempotent: an existing file at `path` is left untouched.
///
/// # Errors
///
/// Returns [`Error::ExistenceCheck`] if the path cannot be inspected, or
/// [`Error::CreateDevice`] if the device node cannot be created.
pub fn ensure_placeholder_device(path: impl AsRef<Path>) -> Result<Placeholder> {
    ensure_placeholder_device_with(path.as_ref(), |path| {
        create_block_device(path, PLACEHOLDER_MAJOR, PLACEHOLDER_MINOR)
    })
}

fn ensure_placeholder_device_with(
    path: &Path,
    create: impl FnOnce(&Path) -> Result<()>,
) -> Result<Placeholder> {
    let exists = path.try_exists().map_err(|source| Error::ExistenceCheck {
        path: path.to_path_buf(),
        source,
    })?;
    if exists {
        log::debug!("Placeholder device `{}` already exists", path.display());
        return Ok(Placeholder::AlreadyPresent);
    }

    log::debug!("Creating placeholder device `{}`", path.display());
    create(path)?;
    Ok(Placeholder::Created)
}
