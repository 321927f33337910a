fn main() -> Result<(), Box<dyn std::error::Error>> {
    // SAFETY: no other thread reads the environment during `main`.
    unsafe {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/image.proto"], &["proto"])?;

    Ok(())
}
