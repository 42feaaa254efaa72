//! Container Storage Interface v1 bindings generated from `proto/csi.proto`.
#![expect(missing_docs, reason = "generated protobuf bindings")]

tonic::include_proto!("csi.v1");
