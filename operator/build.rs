use buildctl_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/buildctl.io_buildrequests_crd.yaml",
        serde_yaml::to_string(&BuildRequest::crd()).unwrap(),
    )
    .unwrap();

    tonic_prost_build::compile_protos("proto/build_engine.proto").unwrap();
}
