//! Protocol Buffer definitions and generated code for the store RPC services.
//!
//! Generated by `tonic-build` from `proto/etcd.proto` at build time.

#[allow(clippy::all, dead_code)]
pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}
