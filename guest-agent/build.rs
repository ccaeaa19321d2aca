fn main() {
    // SAFETY: build-script-only, single-threaded at this point.
    unsafe {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/agent.proto"], &["../proto"])
        .unwrap();
}
