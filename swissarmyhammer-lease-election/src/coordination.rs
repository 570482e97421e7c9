//! Coordination service contract
//!
//! The election core never talks to a concrete ZooKeeper-style client. It only
//! depends on the capability set below, so any hierarchical store offering
//! ephemeral nodes and exclusive create can back it. [`crate::MemoryCoordinator`]
//! provides an in-process implementation.

use async_trait::async_trait;

use crate::error::CoordinationError;

/// Result type for coordination service calls
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// Minimal client interface to a hierarchical coordination service
///
/// Paths are absolute, `/`-separated node names. Ephemeral nodes are bound to
/// the client's current session and disappear when the session ends, including
/// on [`reconnect`](CoordinationClient::reconnect).
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Whether the current session is usable
    fn is_connected(&self) -> bool;

    /// Close the current session (if any) and open a new one
    async fn reconnect(&self) -> CoordinationResult<()>;

    /// Check whether a node exists
    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Create a node and all missing ancestors as permanent, empty nodes
    ///
    /// Succeeds when the node already exists.
    async fn create_path(&self, path: &str) -> CoordinationResult<()>;

    /// Create a single node
    ///
    /// Fails with [`CoordinationError::NodeExists`] when the node is already
    /// present, which makes this the exclusive-create primitive used for the
    /// lock node and version registration.
    async fn create_node(&self, path: &str, data: &str, ephemeral: bool) -> CoordinationResult<()>;

    /// Read a node's data
    async fn get_data(&self, path: &str) -> CoordinationResult<String>;

    /// Overwrite an existing node's data
    async fn set_data(&self, path: &str, data: &str) -> CoordinationResult<()>;

    /// Delete a node
    async fn remove(&self, path: &str) -> CoordinationResult<()>;

    /// List the names (not full paths) of a node's children
    async fn list_children(&self, path: &str) -> CoordinationResult<Vec<String>>;
}

/// Join a child name onto a node path
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    format!("{}/{}", parent, child)
}

/// Parent of a node path, `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
