/// Entry point for the SocketCAN device plugin.
///
/// Registers with the kubelet found in `DEVICE_PLUGIN_DIR` and resolves allocated containers
/// through containerd. Needs `CAP_NET_ADMIN`, `CAP_SYS_ADMIN` and `CAP_MKNOD` on the host
/// (in Kubernetes: a privileged pod in the host PID namespace).
///
/// # Errors
///
/// Returns an error if initialization fails or a fatal error stops the plugin.
///
/// # Examples
///
/// ```bash
/// RUST_LOG=debug SOCKETCAN_POOL_SIZE=10 cargo run
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    Ok(socketcan_device_plugin::run().await?)
}
