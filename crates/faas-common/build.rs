// The Function service has a single unary method, so the service glue is
// described by hand instead of compiling a .proto (no protoc on edge images).
fn main() {
    let call = tonic_build::manual::Method::builder()
        .name("call")
        .route_name("Call")
        .input_type("crate::proto::Message")
        .output_type("crate::proto::Message")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("Function")
        .package("faas")
        .method(call)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
}
