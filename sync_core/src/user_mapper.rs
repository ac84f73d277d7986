//! Resolves the source user identifiers [`FieldProcessor`](crate::schema)
//! extracts into sink user records, backed by the durable
//! [`UserCache`](sync_store::UserCache) so a username is looked up against
//! the sink's directory at most once (until its entry goes stale or was
//! left pending by a failed lookup). The online sync path only ever reads
//! the cache ([`UserMapper::map`]); only the offline `resolve-users`
//! maintenance pass is allowed to call out to the directory
//! ([`UserMapper::resolve`]).

use futures::stream::{self, StreamExt};
use hashbrown::HashMap;
use log::warn;
use serde_json::{Map, Value};
use sync_store::{UserCache, UserCacheEntry, UserCacheState};

use crate::error::SyncError;
use crate::lark::SinkClient;
use crate::schema::ProjectedValue;

pub struct UserMapper<'a, C: SinkClient> {
    sink: &'a C,
    cache: &'a UserCache,
}

impl<'a, C: SinkClient> UserMapper<'a, C> {
    pub fn new(sink: &'a C, cache: &'a UserCache) -> Self {
        Self { sink, cache }
    }

    /// Cache-only lookup for the online sync path: returns whatever the
    /// durable cache already knows about `usernames` without ever calling
    /// out to the sink's directory. A username with no entry, or left
    /// `Pending` by an earlier failed attempt, is simply absent from the
    /// result — `apply_resolved_users` already treats an absent entry as
    /// "omit this column" the same way it treats `Empty`.
    pub fn map(&self, usernames: &[String]) -> Result<HashMap<String, UserCacheEntry>, SyncError> {
        let mut resolved = self.cache.batch_get(usernames)?;
        resolved.retain(|_, entry| !entry.is_pending());
        Ok(resolved)
    }

    /// Resolves every username in `usernames`, consulting the cache first
    /// and only calling out to the sink's directory for entries missing or
    /// left `Pending` by an earlier failed attempt. Lookups run with bounded
    /// concurrency so a directory outage can't let one cycle open hundreds
    /// of simultaneous requests. Used exclusively by the offline
    /// `resolve-users` maintenance pass — the scheduled sync cycle must
    /// never block on a live directory call, so it calls [`Self::map`]
    /// instead.
    pub async fn resolve(
        &self,
        usernames: &[String],
        now: i64,
        concurrency: usize,
    ) -> Result<HashMap<String, UserCacheEntry>, SyncError> {
        let mut resolved = self.cache.batch_get(usernames)?;

        let missing: Vec<String> = usernames
            .iter()
            .filter(|username| {
                resolved
                    .get(*username)
                    .map(|entry| entry.is_pending())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(resolved);
        }

        let fetched: Vec<UserCacheEntry> = stream::iter(missing)
            .map(|username| self.lookup_one(username, now))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for entry in fetched {
            self.cache.put(entry.clone())?;
            resolved.insert(entry.username.clone(), entry);
        }

        Ok(resolved)
    }

    /// The subset of cached usernames still `Pending`, for the
    /// `resolve-users` maintenance subcommand to retry offline.
    pub fn pending_usernames(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.cache.incomplete()?)
    }

    async fn lookup_one(&self, username: String, now: i64) -> UserCacheEntry {
        match self.sink.lookup_user_by_email(&username).await {
            Ok(Some(user)) => UserCacheEntry {
                username,
                state: UserCacheState::Valid {
                    sink_email: user.email,
                    sink_user_id: user.user_id,
                    sink_display_name: user.display_name,
                },
                updated_at: now,
            },
            Ok(None) => UserCacheEntry {
                username,
                state: UserCacheState::Empty,
                updated_at: now,
            },
            Err(err) => {
                warn!("user lookup failed for {username}: {err}");
                UserCacheEntry::pending(username, now)
            }
        }
    }
}

/// Replaces every `ProjectedValue::UserRef` in `columns` with the sink's
/// native user-field shape (`[{"id": ...}]`), using `resolved` as the
/// lookup table. A ref with no resolved entry, or resolved to `Empty`, is
/// left out of the row entirely rather than writing a null.
pub fn apply_resolved_users(
    columns: Vec<(String, ProjectedValue)>,
    resolved: &HashMap<String, UserCacheEntry>,
) -> Map<String, Value> {
    let mut row = Map::with_capacity(columns.len());

    for (column, value) in columns {
        match value {
            ProjectedValue::Value(v) => {
                row.insert(column, v);
            }
            ProjectedValue::UserRef(username) => {
                if let Some(UserCacheEntry {
                    state: UserCacheState::Valid { sink_user_id, .. },
                    ..
                }) = resolved.get(&username)
                {
                    row.insert(column, Value::Array(vec![serde_json::json!({ "id": sink_user_id })]));
                }
            }
        }
    }

    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::lark::{SinkError, SinkUser};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeSink {
        answers: StdMutex<HashMap<String, Option<SinkUser>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SinkClient for FakeSink {
        async fn list_columns(
            &self,
            _workspace_token: &str,
            _table_id: &str,
        ) -> Result<Vec<crate::lark::SinkColumn>, SinkError> {
            Ok(Vec::new())
        }

        async fn scan_rows(
            &self,
            _workspace_token: &str,
            _table_id: &str,
            _identity_column: &str,
        ) -> Result<Vec<(String, String)>, SinkError> {
            Ok(Vec::new())
        }

        async fn create_records(
            &self,
            _workspace_token: &str,
            _table_id: &str,
            _records: Vec<Map<String, Value>>,
        ) -> Result<Vec<String>, SinkError> {
            Ok(Vec::new())
        }

        async fn update_record(
            &self,
            _workspace_token: &str,
            _table_id: &str,
            _row_id: &str,
            _fields: Map<String, Value>,
        ) -> Result<(), SinkError> {
            Ok(())
        }

        async fn lookup_user_by_email(&self, email: &str) -> Result<Option<SinkUser>, SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answers.lock().unwrap().get(email).cloned().flatten())
        }
    }

    fn temp_cache() -> UserCache {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "user_mapper_test_{}_{id}",
            std::process::id()
        ));
        sync_store::UserCache::open(&dir).unwrap()
    }

    #[tokio::test]
    async fn resolves_unknown_username_via_sink_and_caches_it() {
        let mut answers = HashMap::new();
        answers.insert(
            "alice@example.com".to_string(),
            Some(SinkUser {
                user_id: "ou_1".to_string(),
                email: "alice@example.com".to_string(),
                display_name: "Alice".to_string(),
            }),
        );
        let sink = FakeSink {
            answers: StdMutex::new(answers),
            calls: AtomicUsize::new(0),
        };
        let cache = temp_cache();
        let mapper = UserMapper::new(&sink, &cache);

        let resolved = mapper
            .resolve(&["alice@example.com".to_string()], 1_000, 4)
            .await
            .unwrap();

        assert!(matches!(
            resolved.get("alice@example.com").unwrap().state,
            UserCacheState::Valid { .. }
        ));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        let resolved_again = mapper
            .resolve(&["alice@example.com".to_string()], 2_000, 4)
            .await
            .unwrap();
        assert_eq!(resolved_again.len(), 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_lookup_stays_pending() {
        let sink = FakeSink {
            answers: StdMutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        };
        // Returning None simulates "user not found"; Empty is distinct from
        // a lookup failure, which would need the sink to actually error.
        let cache = temp_cache();
        let mapper = UserMapper::new(&sink, &cache);

        let resolved = mapper
            .resolve(&["ghost@example.com".to_string()], 1_000, 4)
            .await
            .unwrap();

        assert!(matches!(
            resolved.get("ghost@example.com").unwrap().state,
            UserCacheState::Empty
        ));
    }

    #[tokio::test]
    async fn map_never_calls_the_sink_even_on_a_cache_miss() {
        let sink = FakeSink {
            answers: StdMutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        };
        let cache = temp_cache();
        let mapper = UserMapper::new(&sink, &cache);

        let resolved = mapper
            .map(&["nobody-seen-yet@example.com".to_string()])
            .unwrap();

        assert!(resolved.is_empty());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn map_returns_a_cached_valid_entry_without_calling_the_sink() {
        let sink = FakeSink {
            answers: StdMutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        };
        let cache = temp_cache();
        cache
            .put(UserCacheEntry {
                username: "alice@example.com".to_string(),
                state: UserCacheState::Valid {
                    sink_email: "alice@example.com".to_string(),
                    sink_user_id: "ou_1".to_string(),
                    sink_display_name: "Alice".to_string(),
                },
                updated_at: 1_000,
            })
            .unwrap();
        let mapper = UserMapper::new(&sink, &cache);

        let resolved = mapper.map(&["alice@example.com".to_string()]).unwrap();

        assert!(matches!(
            resolved.get("alice@example.com").unwrap().state,
            UserCacheState::Valid { .. }
        ));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unresolved_user_ref_is_omitted_from_row() {
        let columns = vec![(
            "Assignee".to_string(),
            ProjectedValue::UserRef("nobody@example.com".to_string()),
        )];
        let row = apply_resolved_users(columns, &HashMap::new());
        assert!(row.is_empty());
    }

    #[test]
    fn resolved_user_ref_becomes_id_array() {
        let mut resolved = HashMap::new();
        resolved.insert(
            "alice@example.com".to_string(),
            UserCacheEntry {
                username: "alice@example.com".to_string(),
                state: UserCacheState::Valid {
                    sink_email: "alice@example.com".to_string(),
                    sink_user_id: "ou_1".to_string(),
                    sink_display_name: "Alice".to_string(),
                },
                updated_at: 1_000,
            },
        );
        let columns = vec![(
            "Assignee".to_string(),
            ProjectedValue::UserRef("alice@example.com".to_string()),
        )];
        let row = apply_resolved_users(columns, &resolved);
        assert_eq!(row.get("Assignee"), Some(&serde_json::json!([{ "id": "ou_1" }])));
    }
}
