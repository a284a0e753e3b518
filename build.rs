fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/vision.proto");
    tonic_build::compile_protos("proto/vision.proto")?;
    Ok(())
}
