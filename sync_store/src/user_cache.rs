//! Global, multi-writer cache of source-user -> sink-user mappings
//! (`user_mapping_cache` on disk). `sled::Tree` is internally synchronized,
//! so concurrent `put`s from independent table-cycle workers are safe
//! without an extra lock in this layer.

use crate::codec::{decode_or_none, encode};
use crate::error::StoreError;
use crate::models::UserCacheEntry;
use hashbrown::HashMap;
use std::path::Path;

/// Global, single on-disk database at `<data_dir>/user_mapping_cache.db`,
/// shared by every table's UserMapper.
pub struct UserCache {
    tree: sled::Db,
}

impl UserCache {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join("user_mapping_cache.db");
        let tree = sled::open(&path).map_err(|source| StoreError::OpenError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { tree })
    }

    #[cfg(test)]
    fn open_temporary() -> Self {
        let tree = sled::Config::new().temporary(true).open().unwrap();
        Self { tree }
    }

    pub fn get(&self, username: &str) -> Result<Option<UserCacheEntry>, StoreError> {
        let Some(bytes) = self.tree.get(username).map_err(StoreError::GetError)? else {
            return Ok(None);
        };
        Ok(decode_or_none(&bytes))
    }

    pub fn put(&self, entry: UserCacheEntry) -> Result<(), StoreError> {
        let bytes = encode(&entry)?;
        self.tree
            .insert(entry.username.as_bytes(), bytes)
            .map_err(StoreError::PutError)?;
        self.tree.flush().map_err(StoreError::FlushError)
    }

    /// Single round-trip lookup of many usernames at once.
    pub fn batch_get(
        &self,
        usernames: &[String],
    ) -> Result<HashMap<String, UserCacheEntry>, StoreError> {
        let mut found = HashMap::with_capacity(usernames.len());
        for username in usernames {
            if let Some(entry) = self.get(username)? {
                found.insert(username.clone(), entry);
            }
        }
        Ok(found)
    }

    /// Usernames still awaiting resolution. With the enum-based state
    /// model, "not yet resolved but missing a sink user id" is
    /// unrepresentable, so this is just the `Pending` entries.
    pub fn incomplete(&self) -> Result<Vec<String>, StoreError> {
        let mut usernames = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item.map_err(StoreError::GetError)?;
            let Some(entry) = decode_or_none::<UserCacheEntry>(&value) else {
                continue;
            };
            if entry.is_pending() {
                usernames.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(usernames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserCacheState;

    fn temp_cache() -> UserCache {
        UserCache::open_temporary()
    }

    #[test]
    fn unknown_username_is_none() {
        let cache = temp_cache();
        assert!(cache.get("alice").unwrap().is_none());
    }

    #[test]
    fn pending_entries_are_incomplete() {
        let cache = temp_cache();
        cache.put(UserCacheEntry::pending("alice", 1_000)).unwrap();
        cache
            .put(UserCacheEntry {
                username: "bob".into(),
                state: UserCacheState::Empty,
                updated_at: 1_000,
            })
            .unwrap();

        let incomplete = cache.incomplete().unwrap();
        assert_eq!(incomplete, vec!["alice".to_string()]);
    }

    #[test]
    fn valid_and_empty_entries_round_trip() {
        let cache = temp_cache();
        let entry = UserCacheEntry {
            username: "carol".into(),
            state: UserCacheState::Valid {
                sink_email: "carol@example.com".into(),
                sink_user_id: "ou_123".into(),
                sink_display_name: "Carol".into(),
            },
            updated_at: 1_000,
        };
        cache.put(entry.clone()).unwrap();
        assert_eq!(cache.get("carol").unwrap(), Some(entry));
    }

    #[test]
    fn batch_get_skips_missing_entries() {
        let cache = temp_cache();
        cache.put(UserCacheEntry::pending("alice", 1_000)).unwrap();

        let found = cache
            .batch_get(&["alice".to_string(), "nobody".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("alice"));
    }
}
