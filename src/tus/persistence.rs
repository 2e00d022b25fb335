use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;
use super::errors::Result;
use super::record::{UploadId, UploadRecord};

/// Keeps upload records across process restarts.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: &UploadRecord) -> Result<()>;

    async fn remove(&self, upload_id: UploadId) -> Result<()>;

    /// Every stored record, oldest first.
    async fn restore(&self) -> Result<Vec<UploadRecord>>;
}

fn oldest_first(mut records: Vec<UploadRecord>) -> Vec<UploadRecord> {
    records.sort_by_key(|record| record.created_at);
    records
}

#[derive(Debug, Default, Clone)]
pub struct MemoryRecordStore {
    records: Arc<Mutex<HashMap<UploadId, UploadRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, upload_id: UploadId) -> Option<UploadRecord> {
        self.records.lock().await.get(&upload_id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: &UploadRecord) -> Result<()> {
        self.records.lock().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn remove(&self, upload_id: UploadId) -> Result<()> {
        self.records.lock().await.remove(&upload_id);
        Ok(())
    }

    async fn restore(&self) -> Result<Vec<UploadRecord>> {
        let records = self.records.lock().await.values().cloned().collect();
        Ok(oldest_first(records))
    }
}

/// All records in one pretty-printed JSON file, rewritten on every change.
pub struct JsonRecordStore {
    path: PathBuf,
    records: Mutex<Option<HashMap<UploadId, UploadRecord>>>,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<HashMap<UploadId, UploadRecord>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(HashMap::new());
        }

        let data = tokio::fs::read_to_string(&self.path).await?;
        let records: Vec<UploadRecord> = serde_json::from_str(&data)?;

        Ok(records.into_iter().map(|record| (record.id, record)).collect())
    }

    async fn flush(&self, records: &HashMap<UploadId, UploadRecord>) -> Result<()> {
        let records = oldest_first(records.values().cloned().collect());
        let data = serde_json::to_string_pretty(&records)?;

        // write-then-rename keeps the previous file intact on a crash
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }

    /// Reads the file on first use and serves the cached map afterwards.
    async fn loaded<'a>(
        &self,
        cache: &'a mut Option<HashMap<UploadId, UploadRecord>>,
    ) -> Result<&'a mut HashMap<UploadId, UploadRecord>> {
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache.get_or_insert_with(HashMap::new))
    }

    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<UploadId, UploadRecord>) + Send,
    {
        let mut guard = self.records.lock().await;
        let records = self.loaded(&mut guard).await?;

        change(&mut *records);
        self.flush(records).await
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn save(&self, record: &UploadRecord) -> Result<()> {
        let record = record.clone();
        self.update(move |records| {
            records.insert(record.id, record);
        }).await
    }

    async fn remove(&self, upload_id: UploadId) -> Result<()> {
        self.update(move |records| {
            records.remove(&upload_id);
        }).await
    }

    async fn restore(&self) -> Result<Vec<UploadRecord>> {
        let mut guard = self.records.lock().await;
        let records = self.loaded(&mut guard).await?;

        Ok(oldest_first(records.values().cloned().collect()))
    }
}
