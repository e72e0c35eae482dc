use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::NodeError;

/// Node instances of one backend, keyed by UUID. Each node sits behind its
/// own mutex; holding it for the duration of an operation is what linearizes
/// per-node bridge command sequences.
pub struct Registry<T> {
    nodes: Mutex<HashMap<Uuid, Arc<Mutex<T>>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: Uuid, node: T) -> Arc<Mutex<T>> {
        let node = Arc::new(Mutex::new(node));
        self.nodes.lock().await.insert(id, node.clone());
        node
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<Mutex<T>>, NodeError> {
        self.nodes
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| NodeError::Precondition(format!("node {id} not found")))
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<Mutex<T>>> {
        self.nodes.lock().await.remove(&id)
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.nodes.lock().await.keys().copied().collect()
    }
}
