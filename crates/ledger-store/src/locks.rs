use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use domain::{EntityKind, LedgerError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{Result, StoreError};

/// A table of entities, each behind its own async mutex.
///
/// The outer `RwLock` only guards membership and is never held across an
/// entity lock acquisition.
pub(crate) struct EntityTable<K, V> {
    kind: EntityKind,
    rows: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> EntityTable<K, V>
where
    K: Clone + Eq + Hash + Display,
{
    pub(crate) fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts a new row. Returns false if the key is already present.
    pub(crate) async fn insert(&self, key: K, value: V) -> bool {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&key) {
            return false;
        }
        rows.insert(key, Arc::new(Mutex::new(value)));
        true
    }

    pub(crate) async fn contains(&self, key: &K) -> bool {
        self.rows.read().await.contains_key(key)
    }

    /// Projects a single row, waiting for any writer to finish.
    pub(crate) async fn view<T>(&self, key: &K, f: impl FnOnce(&V) -> T) -> Option<T> {
        let cell = self.rows.read().await.get(key).cloned()?;
        let value = cell.lock().await;
        Some(f(&value))
    }

    /// Projects every row, keeping the `Some` results.
    pub(crate) async fn filter_map<T>(&self, f: impl Fn(&V) -> Option<T>) -> Vec<T> {
        let cells: Vec<_> = self.rows.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for cell in cells {
            if let Some(item) = f(&*cell.lock().await) {
                out.push(item);
            }
        }
        out
    }

    /// Acquires exclusive access to a row.
    ///
    /// A missing row is a rejection; a wait longer than `timeout` is a
    /// transient conflict.
    pub(crate) async fn lock(
        &self,
        key: K,
        timeout: Option<Duration>,
    ) -> Result<OwnedMutexGuard<V>> {
        let acquire = async {
            let cell = self
                .rows
                .read()
                .await
                .get(&key)
                .cloned()
                .ok_or_else(|| LedgerError::unknown(self.kind, &key))?;
            Ok::<_, StoreError>(cell.lock_owned().await)
        };
        self.bounded(&key, timeout, acquire).await
    }

    /// Acquires exclusive access to a row, creating it with `init` if absent.
    pub(crate) async fn lock_or_insert_with(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        timeout: Option<Duration>,
    ) -> Result<OwnedMutexGuard<V>> {
        let acquire = async {
            let existing = self.rows.read().await.get(&key).cloned();
            let cell = match existing {
                Some(cell) => cell,
                None => self
                    .rows
                    .write()
                    .await
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(init())))
                    .clone(),
            };
            Ok::<_, StoreError>(cell.lock_owned().await)
        };
        self.bounded(&key, timeout, acquire).await
    }

    async fn bounded<T>(
        &self,
        key: &K,
        timeout: Option<Duration>,
        acquire: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout {
            None => acquire.await,
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .unwrap_or_else(|_| {
                    Err(StoreError::conflict(
                        format!("{} {key}", self.kind),
                        format!("lock not acquired within {}ms", limit.as_millis()),
                    ))
                }),
        }
    }
}

impl<K, V> EntityTable<K, V>
where
    K: Clone + Eq + Hash + Display,
    V: Clone,
{
    /// Returns a snapshot of the row, waiting for any writer to finish.
    pub(crate) async fn get(&self, key: &K) -> Option<V> {
        self.view(key, V::clone).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AccountId;

    #[tokio::test]
    async fn insert_refuses_duplicate_keys() {
        let table = EntityTable::new(EntityKind::Account);
        let id = AccountId::new();
        assert!(table.insert(id, 1u32).await);
        assert!(!table.insert(id, 2u32).await);
        assert_eq!(table.get(&id).await, Some(1));
    }

    #[tokio::test]
    async fn lock_on_missing_row_is_unknown_entity() {
        let table: EntityTable<AccountId, u32> = EntityTable::new(EntityKind::Account);
        let err = table.lock(AccountId::new(), None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(LedgerError::UnknownEntity {
                kind: EntityKind::Account,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn lock_times_out_as_conflict() {
        let table = EntityTable::new(EntityKind::Account);
        let id = AccountId::new();
        table.insert(id, 0u32).await;

        let _held = table.lock(id, None).await.unwrap();
        let err = table
            .lock(id, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn lock_or_insert_creates_missing_rows_once() {
        let table: EntityTable<String, Option<u32>> = EntityTable::new(EntityKind::Account);

        {
            let mut slot = table
                .lock_or_insert_with("e1".to_string(), || None, None)
                .await
                .unwrap();
            *slot = Some(7);
        }
        let slot = table
            .lock_or_insert_with("e1".to_string(), || None, None)
            .await
            .unwrap();

        assert_eq!(*slot, Some(7));
    }

    #[tokio::test]
    async fn lock_or_insert_times_out_as_conflict() {
        let table: EntityTable<String, u32> = EntityTable::new(EntityKind::Account);
        let _held = table
            .lock_or_insert_with("e1".to_string(), || 0, None)
            .await
            .unwrap();

        let err = table
            .lock_or_insert_with("e1".to_string(), || 0, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
