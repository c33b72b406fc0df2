fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/api.proto");

    // Compile the CRI v1alpha2 definitions. Both sides are generated: the
    // server for the dispatcher and the client for remote backends.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(
            ".runtime.v1alpha2",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .compile(&["proto/api.proto"], &["proto"])?;

    Ok(())
}
