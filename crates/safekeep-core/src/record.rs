//! Versioned JSON records on top of the secret store's policy documents.
//!
//! Safe records and credential binding records are stored as policy
//! documents. Every change is a read, an in-memory mutation, and a
//! conditional write against the version that was read. Losing the race
//! re-reads and re-applies the mutation, so invariants are always checked
//! against the state that is actually written.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Resource, StoreError};
use crate::store::SecretStoreClient;

/// A record together with the version it was read at.
#[derive(Debug, Clone)]
pub(crate) struct Versioned<T> {
    pub(crate) version: u64,
    pub(crate) record: T,
}

#[derive(Clone)]
pub(crate) struct RecordStore {
    store: Arc<dyn SecretStoreClient>,
    max_conflict_retries: u32,
}

fn to_body<T: Serialize>(path: &str, record: &T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(record).map_err(|e| {
        StoreError::Corrupt {
            path: path.to_owned(),
            reason: format!("serialization failed: {e}"),
        }
        .into()
    })
}

impl RecordStore {
    pub(crate) fn new(store: Arc<dyn SecretStoreClient>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            max_conflict_retries,
        }
    }

    pub(crate) async fn load<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<Versioned<T>>, Error> {
        let Some(doc) = self.store.read_policy(path).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(doc.body).map_err(|e| StoreError::Corrupt {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Some(Versioned {
            version: doc.version,
            record,
        }))
    }

    /// Load a record that must exist.
    pub(crate) async fn require<T: DeserializeOwned>(
        &self,
        path: &str,
        resource: Resource,
        id: &str,
    ) -> Result<Versioned<T>, Error> {
        self.load(path)
            .await?
            .ok_or_else(|| Error::not_found(resource, id))
    }

    /// Write a record that must not exist yet.
    pub(crate) async fn create<T: Serialize>(
        &self,
        path: &str,
        record: &T,
        resource: Resource,
        id: &str,
    ) -> Result<u64, Error> {
        let body = to_body(path, record)?;
        self.store
            .write_policy(path, &body, None)
            .await
            .map_err(|e| Error::from_store_for(resource, id, e))
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<(), Error> {
        self.store.delete_policy(path).await?;
        Ok(())
    }

    pub(crate) async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self.store.list_policies(prefix).await?)
    }

    /// Apply `mutate` to the current record and write it back conditionally.
    ///
    /// `mutate` returns whether it changed anything; an unchanged record is
    /// not written. On a version conflict the record is re-read and `mutate`
    /// runs again, up to the configured retry budget.
    pub(crate) async fn mutate<T, F>(
        &self,
        path: &str,
        resource: Resource,
        id: &str,
        mut mutate: F,
    ) -> Result<(T, bool), Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> Result<bool, Error>,
    {
        let attempts = self.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let Versioned {
                version,
                mut record,
            } = self.require::<T>(path, resource, id).await?;

            if !mutate(&mut record)? {
                return Ok((record, false));
            }

            let body = to_body(path, &record)?;
            match self.store.write_policy(path, &body, Some(version)).await {
                Ok(_) => return Ok((record, true)),
                Err(StoreError::Conflict { .. }) => {
                    debug!(path, attempt, "record version conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict {
            path: path.to_owned(),
            attempts,
        })
    }
}
