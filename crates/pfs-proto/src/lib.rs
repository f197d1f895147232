//! Generated gRPC message and service types for the parallel file system
//! wire protocol, compiled from `proto/pfs.proto`.

pub mod v1 {
    tonic::include_proto!("pfs.v1");
}

pub use v1::*;
