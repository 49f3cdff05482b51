use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::envelope::ChatRecord;

/// Persistence sink for chat content. Write-only; the broker never
/// reads back and never retries.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert_message(&self, record: ChatRecord) -> Result<()>;
}

/// In-memory chat store (for development and tests).
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    records: RwLock<VecDeque<ChatRecord>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ChatRecord> {
        self.records.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn insert_message(&self, record: ChatRecord) -> Result<()> {
        self.records.write().await.push_back(record);
        Ok(())
    }
}
