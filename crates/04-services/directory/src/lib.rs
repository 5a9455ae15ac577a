//! Directory service: allocates device node identities and hosts the
//! server-side instance for each one.
//!
//! `createNode` allocates the next [`NodeId`](device_abi::NodeId) from a
//! process-wide allocator, asks a [`NodeFactory`] to build the instance and
//! registers it; `destroyNode` removes and tears it down. Instances hold a
//! [`DirectoryHandle`] to request their own removal when their client dies.

mod allocator;
mod client;
mod registry;
mod service;

pub use allocator::{global_allocator, NodeIdAllocator, SharedAllocator};
pub use client::{DirectoryClient, DirectoryProxy};
pub use registry::{DirectoryHandle, DirectoryRegistry, HostedNode, NodeFactory};
pub use service::{map_node_error, DirectoryNode, DirectoryServer, DirectoryService};
