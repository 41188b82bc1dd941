//! Mock ContextStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{PointerPosition, ReplicationPointer};
use crate::storage::{ContextStore, Result, StorageError};

/// Mock context store that keeps the pointer and generation in memory.
#[derive(Default)]
pub struct MockContextStore {
    pointer: RwLock<Option<ReplicationPointer>>,
    generation: RwLock<u64>,
}

impl MockContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MockContextStore {
    async fn pointer(&self) -> Result<Option<ReplicationPointer>> {
        Ok(self.pointer.read().await.clone())
    }

    async fn set_pointer(&self, position: &PointerPosition) -> Result<ReplicationPointer> {
        let mut guard = self.pointer.write().await;
        let pointer = ReplicationPointer::anchored(position, guard.as_ref());
        *guard = Some(pointer.clone());
        Ok(pointer)
    }

    async fn pointer_update_timestamp(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let mut guard = self.pointer.write().await;
        let pointer = guard.as_mut().ok_or(StorageError::NoPointer)?;
        pointer.timestamp = timestamp;
        Ok(())
    }

    async fn pointer_advance(&self, offset: i64) -> Result<ReplicationPointer> {
        let mut guard = self.pointer.write().await;
        let pointer = guard.as_mut().ok_or(StorageError::NoPointer)?;
        pointer.seqno = (pointer.seqno as i64 + offset).max(0) as u64;
        Ok(pointer.clone())
    }

    async fn generation(&self) -> Result<u64> {
        Ok(*self.generation.read().await)
    }

    async fn generation_advance(&self) -> Result<u64> {
        let mut generation = self.generation.write().await;
        *generation += 1;
        Ok(*generation)
    }
}
