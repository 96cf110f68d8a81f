//! Cross-participant synchronization capability
//!
//! Multi-participant saves need a "wait until everyone reaches this point"
//! primitive. The engine consumes it as an injected trait so the process
//! topology stays outside the persistence layer; the handler calls it exactly
//! once per save, after the finalize marker is durable. Timeout and
//! cancellation policy belong to the implementation, not the caller.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;

/// Barrier primitive consumed by the checkpoint handler
#[async_trait]
pub trait Barrier: Send + Sync {
    /// Block until every participant has called `synchronize` with this tag
    async fn synchronize(&self, tag: &str) -> Result<()>;
}

/// Barrier for single-participant saves: returns immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBarrier;

#[async_trait]
impl Barrier for NoopBarrier {
    async fn synchronize(&self, _tag: &str) -> Result<()> {
        Ok(())
    }
}

/// In-process barrier synchronizing a fixed number of participants
///
/// Participants sharing one `LocalBarrier` rendezvous per tag; the tag's
/// entry is recycled once everyone has passed, so the same tag can be reused
/// by later saves.
pub struct LocalBarrier {
    participants: usize,
    pending: Mutex<HashMap<String, Arc<tokio::sync::Barrier>>>,
}

impl LocalBarrier {
    /// Create a barrier expecting `participants` arrivals per tag
    pub fn new(participants: usize) -> Self {
        Self {
            participants,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }
}

#[async_trait]
impl Barrier for LocalBarrier {
    async fn synchronize(&self, tag: &str) -> Result<()> {
        let barrier = {
            let mut pending = self.pending.lock();
            pending
                .entry(tag.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Barrier::new(self.participants)))
                .clone()
        };

        debug!(tag, participants = self.participants, "Waiting on barrier");
        let result = barrier.wait().await;

        if result.is_leader() {
            self.pending.lock().remove(tag);
        }
        debug!(tag, "Barrier released");
        Ok(())
    }
}
