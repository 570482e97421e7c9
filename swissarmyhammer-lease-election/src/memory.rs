//! In-process coordination service
//!
//! [`MemoryCoordinator`] holds a node tree shared by any number of
//! [`MemoryClient`]s, each with its own session. It follows the semantics the
//! election core relies on: exclusive create, ephemeral nodes owned by a
//! session, and session loss on reconnect. Clients can be partitioned to
//! simulate a coordinator outage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::coordination::{parent_path, CoordinationClient, CoordinationResult};
use crate::error::CoordinationError;

#[derive(Debug, Clone)]
struct Node {
    data: String,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    next_session: u64,
}

impl Tree {
    fn open_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn close_session(&mut self, session: u64) {
        self.nodes.retain(|_, node| node.owner != Some(session));
    }

    fn contains(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn has_children(&self, path: &str) -> bool {
        self.nodes.keys().any(|key| parent_path(key) == Some(path))
    }
}

/// Shared in-memory node tree
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new connected client with its own session
    pub fn client(&self) -> MemoryClient {
        let session = self.tree().open_session();
        MemoryClient {
            inner: Arc::new(ClientInner {
                coordinator: self.clone(),
                session: Mutex::new(Some(session)),
                partitioned: AtomicBool::new(false),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Read a node directly, bypassing any session
    pub fn get(&self, path: &str) -> Option<String> {
        self.tree().nodes.get(path).map(|node| node.data.clone())
    }

    /// Write a permanent node directly, creating it if needed
    pub fn put(&self, path: &str, data: &str) {
        self.tree().nodes.insert(
            path.to_string(),
            Node {
                data: data.to_string(),
                owner: None,
            },
        );
    }

    /// Whether a node exists, bypassing any session
    pub fn contains(&self, path: &str) -> bool {
        self.tree().contains(path)
    }

    /// Names of a node's children, bypassing any session
    pub fn children(&self, path: &str) -> Vec<String> {
        self.tree()
            .nodes
            .keys()
            .filter(|key| parent_path(key.as_str()) == Some(path))
            .filter_map(|key| key.rsplit('/').next().map(str::to_string))
            .collect()
    }
}

#[derive(Debug)]
struct ClientInner {
    coordinator: MemoryCoordinator,
    session: Mutex<Option<u64>>,
    partitioned: AtomicBool,
    writes: AtomicU64,
}

/// A session-holding client of a [`MemoryCoordinator`]
///
/// Cloning yields a handle to the same session, which lets tests keep control
/// over a client that has been handed to an elector.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    inner: Arc<ClientInner>,
}

impl MemoryClient {
    fn session(&self) -> MutexGuard<'_, Option<u64>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session id, if connected
    fn live_session(&self) -> CoordinationResult<u64> {
        if self.inner.partitioned.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss);
        }
        (*self.session()).ok_or(CoordinationError::ConnectionLoss)
    }

    /// Cut this client off from the coordinator
    ///
    /// The coordinator expires the session, dropping its ephemeral nodes, and
    /// every call fails with [`CoordinationError::ConnectionLoss`] until
    /// [`heal`](Self::heal) is called.
    pub fn partition(&self) {
        self.inner.partitioned.store(true, Ordering::SeqCst);
        if let Some(session) = self.session().take() {
            self.inner.coordinator.tree().close_session(session);
        }
    }

    /// Allow this client to reach the coordinator again
    ///
    /// The client stays disconnected until it reconnects.
    pub fn heal(&self) {
        self.inner.partitioned.store(false, Ordering::SeqCst);
    }

    /// Number of successful `set_data`/`create_node` calls made by this client
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    fn is_connected(&self) -> bool {
        self.live_session().is_ok()
    }

    async fn reconnect(&self) -> CoordinationResult<()> {
        if self.inner.partitioned.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss);
        }
        let mut session = self.session();
        let mut tree = self.inner.coordinator.tree();
        if let Some(old) = session.take() {
            tree.close_session(old);
        }
        *session = Some(tree.open_session());
        Ok(())
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.live_session()?;
        Ok(self.inner.coordinator.tree().contains(path))
    }

    async fn create_path(&self, path: &str) -> CoordinationResult<()> {
        self.live_session()?;
        let mut tree = self.inner.coordinator.tree();
        let mut ancestors = Vec::new();
        let mut current = Some(path.trim_end_matches('/'));
        while let Some(p) = current {
            if p.is_empty() || p == "/" {
                break;
            }
            ancestors.push(p.to_string());
            current = parent_path(p);
        }
        for p in ancestors.into_iter().rev() {
            tree.nodes.entry(p).or_insert_with(|| Node {
                data: String::new(),
                owner: None,
            });
        }
        Ok(())
    }

    async fn create_node(&self, path: &str, data: &str, ephemeral: bool) -> CoordinationResult<()> {
        let session = self.live_session()?;
        let mut tree = self.inner.coordinator.tree();
        if tree.contains(path) {
            return Err(CoordinationError::NodeExists {
                path: path.to_string(),
            });
        }
        match parent_path(path) {
            Some(parent) if tree.contains(parent) => {}
            _ => {
                return Err(CoordinationError::NoNode {
                    path: path.to_string(),
                })
            }
        }
        tree.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_string(),
                owner: ephemeral.then_some(session),
            },
        );
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<String> {
        self.live_session()?;
        self.inner
            .coordinator
            .tree()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode {
                path: path.to_string(),
            })
    }

    async fn set_data(&self, path: &str, data: &str) -> CoordinationResult<()> {
        self.live_session()?;
        let mut tree = self.inner.coordinator.tree();
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode {
                path: path.to_string(),
            })?;
        node.data = data.to_string();
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, path: &str) -> CoordinationResult<()> {
        self.live_session()?;
        let mut tree = self.inner.coordinator.tree();
        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_string(),
            });
        }
        if tree.has_children(path) {
            return Err(CoordinationError::NotEmpty {
                path: path.to_string(),
            });
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn list_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.live_session()?;
        if !self.inner.coordinator.contains(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(self.inner.coordinator.children(path))
    }
}
