//! Ops commands against a running node's admin API

pub mod status;

pub use status::{content_detail, list_content, list_peers, node_status, NodeStatus};
