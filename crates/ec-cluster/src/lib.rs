//! Cluster directory (C2) and placement function (C5): the immutable,
//! in-process view of node identities, roles, and addresses, plus the pure
//! mapping from block index to stripe location that depends on the
//! directory's notion of cluster size.

mod config;
mod placement;

pub use config::{discover, ClusterDirectory, NodeInfo};
pub use placement::{node_for_fragment, placement, DataPosition};
