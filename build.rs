fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().build_server(false).compile_protos(
        &[
            "proto/perftools/profiles/profile.proto",
            "proto/parca/profilestore/v1alpha1/profilestore.proto",
            "proto/parca/debuginfo/v1alpha1/debuginfo.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
