use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::atomic::write_atomic_async;

/// A record that can be upserted by a stable key
pub trait Keyed {
    fn key(&self) -> &str;
}

/// Extracted records kept as one JSON array file.
///
/// Records with the same key replace each other. The whole file is rewritten
/// atomically on every upsert, so concurrent workers go through a lock.
pub struct RecordStore<R> {
    path: PathBuf,
    records: Mutex<Vec<R>>,
}

impl<R> RecordStore<R>
where
    R: Keyed + Serialize + DeserializeOwned + Clone + Send,
{
    /// Open the store, loading whatever is already on disk
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .context(format!("Failed to parse record file: {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).context(format!("Failed to read record file: {}", path.display()))
            }
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a record and persist the file
    pub async fn upsert(&self, record: R) -> Result<()> {
        let mut records = self.records.lock().await;

        match records.iter_mut().find(|r| r.key() == record.key()) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }

        let bytes = serde_json::to_vec_pretty(&*records).context("Failed to serialize records")?;
        write_atomic_async(self.path.clone(), bytes)
            .await
            .context(format!("Failed to write record file: {}", self.path.display()))?;

        debug!(total = records.len(), "Stored record");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Company {
        id: String,
        name: String,
    }

    impl Keyed for Company {
        fn key(&self) -> &str {
            &self.id
        }
    }

    fn saved(path: &Path) -> Vec<Company> {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn company(id: &str, name: &str) -> Company {
        Company {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store: RecordStore<Company> =
            RecordStore::open(dir.path().join("companies.json")).await.unwrap();

        store.upsert(company("acme", "Acme")).await.unwrap();
        store.upsert(company("initech", "Initech")).await.unwrap();
        store.upsert(company("acme", "Acme Corp")).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(
            saved(store.path()),
            vec![company("acme", "Acme Corp"), company("initech", "Initech")]
        );
    }

    #[tokio::test]
    async fn test_reopen_sees_saved_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.json");

        let store: RecordStore<Company> = RecordStore::open(&path).await.unwrap();
        store.upsert(company("acme", "Acme")).await.unwrap();
        drop(store);

        let reopened: RecordStore<Company> = RecordStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        reopened.upsert(company("acme", "Acme Corp")).await.unwrap();
        assert_eq!(saved(&path), vec![company("acme", "Acme Corp")]);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<RecordStore<Company>> =
            Arc::new(RecordStore::open(dir.path().join("companies.json")).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(company(&format!("c{}", i), "x")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reopened: RecordStore<Company> = RecordStore::open(store.path()).await.unwrap();
        assert_eq!(reopened.len().await, 10);
    }
}
