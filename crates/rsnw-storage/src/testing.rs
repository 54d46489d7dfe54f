//! In-memory store mirroring the MySQL state-machine semantics, for
//! deterministic pipeline tests without a database.

use std::sync::Mutex;

use async_trait::async_trait;
use rsnw_core::{CleanedRecord, ItemStatus, NewsItem};

use crate::{FailureOutcome, NewsStore, StoreError};

pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_threshold: u32,
}

struct Inner {
    rows: Vec<NewsItem>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new(fail_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rows: Vec::new(),
                next_id: 1,
            }),
            fail_threshold: fail_threshold.max(1),
        }
    }

    /// Snapshot of every stored row, insertion order.
    pub fn items(&self) -> Vec<NewsItem> {
        self.inner.lock().unwrap().rows.clone()
    }
}

#[async_trait]
impl NewsStore for MemoryStore {
    async fn insert(&self, batch: &[CleanedRecord]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0usize;
        for record in batch {
            let duplicate = inner
                .rows
                .iter()
                .any(|row| row.title == record.title && row.url == record.url);
            if duplicate {
                continue;
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.rows.push(NewsItem {
                id,
                title: record.title.clone(),
                url: record.url.clone(),
                publish_date: record.publish_date,
                source: record.source.clone(),
                description: record.description.clone(),
                status: ItemStatus::New,
                fail_count: 0,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn pending(&self) -> Result<Vec<NewsItem>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<NewsItem> = inner
            .rows
            .iter()
            .filter(|row| row.status == ItemStatus::New)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.publish_date, row.id));
        Ok(rows)
    }

    async fn mark_submitted(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.rows.iter_mut().find(|row| row.id == id) {
            if row.status != ItemStatus::Error {
                row.status = ItemStatus::Submitted;
            }
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64) -> Result<FailureOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let threshold = self.fail_threshold;
        let row = inner
            .rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if row.status == ItemStatus::New {
            row.fail_count += 1;
            if row.fail_count >= threshold {
                row.status = ItemStatus::Error;
            }
        }
        Ok(FailureOutcome {
            fail_count: row.fail_count,
            escalated: row.status == ItemStatus::Error,
        })
    }
}
