fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        // Both sides are needed: the daemon serves DevicePlugin and calls
        // Registration, tests do the inverse.
        .compile_protos(&["proto/v1beta1.proto"], &["proto"])?;
    Ok(())
}
