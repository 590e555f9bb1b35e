//! In-process transport over tokio mpsc channels

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::{AssignmentInbox, AssignmentTransport, NodeMessage, TransportError, TransportResult};

/// Buffered messages per inbox
const INBOX_CAPACITY: usize = 1024;

/// Transport for nodes living in the same process
#[derive(Default)]
pub struct LocalTransport {
    inboxes: Mutex<HashMap<String, mpsc::Sender<NodeMessage>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open inboxes
    pub async fn inbox_count(&self) -> usize {
        self.inboxes
            .lock()
            .await
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl AssignmentTransport for LocalTransport {
    async fn dispatch(&self, node_id: &str, message: NodeMessage) -> TransportResult<()> {
        let sender = self
            .inboxes
            .lock()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownNode(node_id.to_string()))?;

        if sender.send(message).await.is_err() {
            self.inboxes.lock().await.remove(node_id);
            return Err(TransportError::UnknownNode(node_id.to_string()));
        }
        Ok(())
    }

    async fn open_inbox(&self, node_id: &str) -> TransportResult<Box<dyn AssignmentInbox>> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.lock().await.insert(node_id.to_string(), tx);
        tracing::debug!(node = %node_id, "Opened local inbox");
        Ok(Box::new(LocalInbox { rx }))
    }
}

/// Receiving end of a local inbox
pub struct LocalInbox {
    rx: mpsc::Receiver<NodeMessage>,
}

#[async_trait]
impl AssignmentInbox for LocalInbox {
    async fn recv(&mut self, wait: Duration) -> TransportResult<Option<NodeMessage>> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }
}
