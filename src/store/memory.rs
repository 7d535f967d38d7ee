//! In-memory coordination store
//!
//! A single-process implementation of the store contract: a tree of
//! versioned nodes, sessions that own ephemeral entries, and session
//! expiry that removes them atomically. Fault hooks let callers simulate
//! the failures a networked store produces (dropped connections, transient
//! unavailability, expired sessions, rejected writes and deletes).

use super::{
    parent_path, validate_path, CoordinationStore, SessionId, Stat, StoreError, StoreResult,
    StoreSession,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct ZNode {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<SessionId>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Next N operations fail with ConnectionClosed
    disconnects: usize,
    /// Next N operations fail with Unavailable
    transient: usize,
    /// Deletes on these paths fail with NoAuth
    denied_deletes: HashSet<String>,
    /// Creates and sets on these paths fail with NoAuth
    denied_writes: HashSet<String>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
    reachable: bool,
    faults: Faults,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                version: 0,
                ephemeral_owner: None,
            },
        );
        Self {
            nodes,
            sessions: HashSet::new(),
            next_session: 1,
            reachable: true,
            faults: Faults::default(),
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str, node: &ZNode) -> Stat {
        Stat {
            version: node.version,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.children_of(path).len(),
        }
    }

    /// Session and fault checks shared by every primitive.
    fn admit(&mut self, session: SessionId) -> StoreResult<()> {
        if !self.sessions.contains(&session) {
            return Err(StoreError::SessionExpired);
        }
        if !self.reachable {
            return Err(StoreError::NotConnected);
        }
        if self.faults.disconnects > 0 {
            self.faults.disconnects -= 1;
            return Err(StoreError::ConnectionClosed);
        }
        if self.faults.transient > 0 {
            self.faults.transient -= 1;
            return Err(StoreError::Unavailable("injected transient failure".into()));
        }
        Ok(())
    }

    fn drop_session(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        self.nodes
            .retain(|_, node| node.ephemeral_owner != Some(session));
    }
}

/// In-process coordination store
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expire a session as the store would after its timeout.
    pub fn expire_session(&self, session: SessionId) {
        tracing::debug!(session, "Expiring store session");
        self.tree().drop_session(session);
    }

    /// Make the store reachable or unreachable for new sessions and operations.
    pub fn set_reachable(&self, reachable: bool) {
        self.tree().reachable = reachable;
    }

    /// Fail the next `count` operations with a dropped connection.
    pub fn inject_disconnects(&self, count: usize) {
        self.tree().faults.disconnects += count;
    }

    /// Fail the next `count` operations with a transient error.
    pub fn inject_transient_failures(&self, count: usize) {
        self.tree().faults.transient += count;
    }

    /// Reject deletes of `path` until cleared.
    pub fn deny_delete(&self, path: &str) {
        self.tree().faults.denied_deletes.insert(path.to_string());
    }

    pub fn allow_delete(&self, path: &str) {
        self.tree().faults.denied_deletes.remove(path);
    }

    /// Reject creates and sets of `path` until cleared.
    pub fn deny_writes(&self, path: &str) {
        self.tree().faults.denied_writes.insert(path.to_string());
    }

    pub fn allow_writes(&self, path: &str) {
        self.tree().faults.denied_writes.remove(path);
    }

    /// Whether `path` currently exists, bypassing sessions.
    pub fn contains(&self, path: &str) -> bool {
        self.tree().nodes.contains_key(path)
    }

    pub fn live_sessions(&self) -> usize {
        self.tree().sessions.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn open_session(
        &self,
        address: &str,
        _session_timeout: Duration,
    ) -> StoreResult<Arc<dyn StoreSession>> {
        let mut tree = self.tree();
        if !tree.reachable {
            return Err(StoreError::Unavailable(format!("{} is not reachable", address)));
        }
        let id = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(id);
        Ok(Arc::new(MemorySession {
            id,
            tree: self.tree.clone(),
        }))
    }
}

/// Session against a `MemoryStore`
pub struct MemorySession {
    id: SessionId,
    tree: Arc<Mutex<Tree>>,
}

impl MemorySession {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> StoreResult<()> {
        validate_path(path)?;
        let mut tree = self.tree();
        tree.admit(self.id)?;

        if tree.faults.denied_writes.contains(path) {
            return Err(StoreError::NoAuth(path.to_string()));
        }
        if tree.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        let parent = parent_path(path).unwrap_or("/");
        match tree.nodes.get(parent) {
            None => return Err(StoreError::NoNode(parent.to_string())),
            Some(node) if node.ephemeral_owner.is_some() => {
                return Err(StoreError::BadArguments(format!(
                    "ephemeral node {} cannot have children",
                    parent
                )))
            }
            Some(_) => {}
        }

        tree.nodes.insert(
            path.to_string(),
            ZNode {
                data: data.to_vec(),
                version: 0,
                ephemeral_owner: ephemeral.then_some(self.id),
            },
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
        validate_path(path)?;
        let mut tree = self.tree();
        tree.admit(self.id)?;

        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        Ok((node.data.clone(), tree.stat(path, node)))
    }

    async fn set(&self, path: &str, data: &[u8], version: Option<i32>) -> StoreResult<Stat> {
        validate_path(path)?;
        let mut tree = self.tree();
        tree.admit(self.id)?;

        if tree.faults.denied_writes.contains(path) {
            return Err(StoreError::NoAuth(path.to_string()));
        }
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.version {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        let node = node.clone();
        Ok(tree.stat(path, &node))
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let mut tree = self.tree();
        tree.admit(self.id)?;

        if path == "/" {
            return Err(StoreError::BadArguments("cannot delete the root".into()));
        }
        if tree.faults.denied_deletes.contains(path) {
            return Err(StoreError::NoAuth(path.to_string()));
        }
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !tree.children_of(path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        validate_path(path)?;
        let mut tree = self.tree();
        tree.admit(self.id)?;

        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(tree.children_of(path))
    }

    async fn close(&self) {
        self.tree().drop_session(self.id);
    }
}
