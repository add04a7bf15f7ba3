//! Runtime configuration, read from environment variables.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Resource namespace advertised to the kubelet, in FQDN format.
pub const RESOURCE_NAMESPACE: &str = "socketcan.mpreu.de";
/// Name of the single device plugin living in [`RESOURCE_NAMESPACE`].
pub const PLUGIN_NAME: &str = "vcan";
/// Device plugin API version implemented by this crate.
pub const API_VERSION: &str = "v1beta1";
/// Name of the interface created inside every container.
pub const INTERFACE_NAME: &str = "vcan0";
/// Directory prefix for the per-device paths inside a container.
pub const CONTAINER_PATH_PREFIX: &str = "/tmp/device-plugin-socketcan";
/// Name of the kubelet's registration socket inside the plugin directory.
pub const KUBELET_SOCKET: &str = "kubelet.sock";

const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";
const DEFAULT_CONTAINERD_SOCKET: &str = "/var/run/containerd/containerd.sock";
const DEFAULT_CONTAINERD_NAMESPACE: &str = "k8s.io";
const DEFAULT_PLACEHOLDER_DEVICE: &str = "/var/run/device-plugin-socketcan-fakedev";
const DEFAULT_POOL_SIZE: usize = 100;
const DEFAULT_RETRIES: u32 = 60;
const DEFAULT_BACKOFF_SECS: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value `{value}` for environment variable `{key}`")]
    InvalidValue { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Plugin configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding `kubelet.sock` and the plugin's own socket.
    pub plugin_dir: PathBuf,
    pub containerd_socket: PathBuf,
    /// containerd namespace searched when resolving containers.
    pub containerd_namespace: String,
    /// Host path of the placeholder block device handed to every container.
    pub placeholder_device: PathBuf,
    /// Number of advertised devices.
    pub pool_size: usize,
    /// Attempts per allocation before it is abandoned.
    pub retries: u32,
    /// Linear back-off unit; attempt `n` waits `n` units.
    pub backoff_unit: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            containerd_socket: PathBuf::from(DEFAULT_CONTAINERD_SOCKET),
            containerd_namespace: DEFAULT_CONTAINERD_NAMESPACE.to_owned(),
            placeholder_device: PathBuf::from(DEFAULT_PLACEHOLDER_DEVICE),
            pool_size: DEFAULT_POOL_SIZE,
            retries: DEFAULT_RETRIES,
            backoff_unit: Duration::from_secs(DEFAULT_BACKOFF_SECS),
        }
    }
}

impl Config {
    /// Builds the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] if a numeric variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, falling back to the
    /// defaults for every key the lookup does not know.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] if a numeric variable cannot be parsed, or if the
    /// back-off unit is so large that the delay before the last attempt overflows.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let retries = parse_or(&lookup, "SOCKETCAN_RETRIES", defaults.retries)?;
        let backoff_secs: u64 =
            parse_or(&lookup, "SOCKETCAN_BACKOFF_SECS", DEFAULT_BACKOFF_SECS)?;
        // The longest delay, before the last attempt, must be representable.
        if backoff_secs
            .checked_mul(u64::from(retries.saturating_sub(1)))
            .is_none()
        {
            return Err(Error::InvalidValue {
                key: "SOCKETCAN_BACKOFF_SECS",
                value: backoff_secs.to_string(),
            });
        }

        Ok(Self {
            plugin_dir: lookup("DEVICE_PLUGIN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_dir),
            containerd_socket: lookup("CONTAINERD_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.containerd_socket),
            containerd_namespace: lookup("CONTAINERD_NAMESPACE")
                .unwrap_or(defaults.containerd_namespace),
            placeholder_device: lookup("SOCKETCAN_PLACEHOLDER_DEVICE")
                .map(PathBuf::from)
                .unwrap_or(defaults.placeholder_device),
            pool_size: parse_or(&lookup, "SOCKETCAN_POOL_SIZE", defaults.pool_size)?,
            retries,
            backoff_unit: Duration::from_secs(backoff_secs),
        })
    }

    /// Fully qualified resource name, e.g. `socketcan.mpreu.de/vcan`.
    pub fn resource_name(&self) -> String {
        format!("{RESOURCE_NAMESPACE}/{PLUGIN_NAME}")
    }

    /// File name of the plugin's socket inside [`Config::plugin_dir`].
    pub fn plugin_endpoint(&self) -> String {
        format!("{RESOURCE_NAMESPACE}_{PLUGIN_NAME}.sock")
    }

    pub fn plugin_socket(&self) -> PathBuf {
        self.plugin_dir.join(self.plugin_endpoint())
    }

    pub fn kubelet_socket(&self) -> PathBuf {
        self.plugin_dir.join(KUBELET_SOCKET)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidValue { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.pool_size, 100);
        assert_eq!(config.retries, 60);
        assert_eq!(config.backoff_unit, Duration::from_secs(1));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("DEVICE_PLUGIN_DIR", "/tmp/plugins"),
            ("CONTAINERD_NAMESPACE", "default"),
            ("SOCKETCAN_POOL_SIZE", " 5 "),
            ("SOCKETCAN_RETRIES", "3"),
            ("SOCKETCAN_BACKOFF_SECS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.plugin_dir, PathBuf::from("/tmp/plugins"));
        assert_eq!(config.containerd_namespace, "default");
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.retries, 3);
        assert_eq!(config.backoff_unit, Duration::from_secs(2));
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let err = Config::from_lookup(lookup_from(&[("SOCKETCAN_POOL_SIZE", "many")]))
            .unwrap_err();
        match err {
            Error::InvalidValue { key, value } => {
                assert_eq!(key, "SOCKETCAN_POOL_SIZE");
                assert_eq!(value, "many");
            }
        }
    }

    #[test]
    fn test_from_lookup_rejects_overflowing_backoff() {
        let err = Config::from_lookup(lookup_from(&[(
            "SOCKETCAN_BACKOFF_SECS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidValue { key: "SOCKETCAN_BACKOFF_SECS", .. }
        ));

        // A single attempt never waits, so any unit is fine.
        let config = Config::from_lookup(lookup_from(&[
            ("SOCKETCAN_RETRIES", "1"),
            ("SOCKETCAN_BACKOFF_SECS", "18446744073709551615"),
        ]))
        .unwrap();
        assert_eq!(config.backoff_unit, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_socket_paths() {
        let config = Config::default();
        assert_eq!(config.resource_name(), "socketcan.mpreu.de/vcan");
        assert_eq!(
            config.plugin_socket(),
            PathBuf::from("/var/lib/kubelet/device-plugins/socketcan.mpreu.de_vcan.sock")
        );
        assert_eq!(
            config.kubelet_socket(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
    }
}
