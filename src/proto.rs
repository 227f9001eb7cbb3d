//! gRPC protocol definitions for the CSI node plugin
//!
//! This module contains the generated Protobuf and gRPC code for the
//! `csi.v1.Identity` and `csi.v1.Node` services that kubelet drives over
//! the plugin's Unix domain socket.
//!
//! # Protocol Overview
//!
//! Kubelet registers the plugin through the node-driver-registrar sidecar,
//! then calls:
//!
//! - `Identity`: plugin name/version, capabilities, liveness probe
//! - `Node`: stage/unstage (inert), publish/unpublish (tmpfs lifecycle),
//!   capability negotiation and node info
//!
//! Only server stubs are generated; this process never dials another plugin.

#![allow(missing_docs)] // Generated code doesn't have docs
#![allow(clippy::doc_overindented_list_items)] // Generated proto docs have formatting issues

/// Generated protobuf and gRPC code for the CSI specification
pub mod csi {
    /// Version 1 of the CSI protocol
    pub mod v1 {
        tonic::include_proto!("csi.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use csi::v1::*;
