fn main() -> std::io::Result<()> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/deviceplugin/v1beta1/api.proto",
                "proto/containerd/api/services/containers/v1/containers.proto",
                "proto/containerd/api/services/tasks/v1/tasks.proto",
                "proto/containerd/api/types/task/task.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
