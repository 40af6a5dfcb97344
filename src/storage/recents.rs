//! Recently opened vaults

use crate::error::Result;
use crate::storage::{AdapterKind, VaultHandle};
use crate::store::{get_json, put_json, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Key the list is stored under
pub const RECENTS_KEY: &str = "vault.recents";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentVaultRecord {
    pub id: String,
    pub name: String,
    /// Adapter kind that opened it
    pub source: String,
    pub last_opened_at: DateTime<Utc>,
}

/// Move `handle` to the front, dropping any older entry for it and
/// anything past `limit`
pub(crate) fn touch(
    list: &mut Vec<RecentVaultRecord>,
    handle: &VaultHandle,
    source: AdapterKind,
    limit: usize,
) {
    list.retain(|record| record.id != handle.id);
    list.insert(
        0,
        RecentVaultRecord {
            id: handle.id.clone(),
            name: handle.name.clone(),
            source: source.as_str().to_string(),
            last_opened_at: Utc::now(),
        },
    );
    list.truncate(limit);
}

/// Capped most-recent-first list in a key-value store
pub struct RecentVaults {
    store: Arc<dyn KeyValueStore>,
    limit: usize,
}

impl RecentVaults {
    pub fn new(store: Arc<dyn KeyValueStore>, limit: usize) -> Self {
        RecentVaults { store, limit }
    }

    pub fn list(&self) -> Result<Vec<RecentVaultRecord>> {
        Ok(get_json(self.store.as_ref(), RECENTS_KEY)?.unwrap_or_default())
    }

    /// Record that `handle` was just opened
    pub fn touch(&self, handle: &VaultHandle, source: AdapterKind) -> Result<()> {
        let mut list = self.list()?;
        touch(&mut list, handle, source, self.limit);
        put_json(self.store.as_ref(), RECENTS_KEY, &list)
    }

    /// Remembered display name for a vault id
    pub fn name_of(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|record| record.id == id)
            .map(|record| record.name))
    }
}
