use std::collections::VecDeque;
use super::record::{UploadId, UploadRecord};

/// FIFO of pending uploads. The head is the only record allowed to transfer.
#[derive(Debug, Default)]
pub struct UploadQueue {
    records: VecDeque<UploadRecord>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record, returning `true` when it became the head.
    pub fn enqueue(&mut self, record: UploadRecord) -> bool {
        self.records.push_back(record);
        self.records.len() == 1
    }

    pub fn current(&self) -> Option<&UploadRecord> {
        self.records.front()
    }

    pub fn current_mut(&mut self) -> Option<&mut UploadRecord> {
        self.records.front_mut()
    }

    pub fn contains(&self, upload_id: UploadId) -> bool {
        self.records.iter().any(|record| record.id == upload_id)
    }

    pub fn get(&self, upload_id: UploadId) -> Option<&UploadRecord> {
        self.records.iter().find(|record| record.id == upload_id)
    }

    pub fn is_current(&self, upload_id: UploadId) -> bool {
        self.current().is_some_and(|record| record.id == upload_id)
    }

    pub fn remove(&mut self, upload_id: UploadId) -> Option<UploadRecord> {
        let index = self.records.iter().position(|record| record.id == upload_id)?;
        self.records.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
