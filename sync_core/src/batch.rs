//! Splits a cycle's creates into sink API calls, shrinking the batch size
//! (rather than failing the whole cycle) when the sink rejects a batch
//! outright — the same "degrade gracefully under a request-size limit"
//! shape the source client uses for its key-batched subqueries, just
//! reactive instead of a fixed constant because Lark's effective limit can
//! vary by payload shape. Before that reactive shrink ever fires, chunks are
//! also capped proactively by the average field count/payload size of the
//! rows going into them, since a handful of very wide issues can blow the
//! request size limit well under 500 rows.
//!
//! Updates have no batch endpoint at all: each row is sent and retried
//! independently, so one bad row never blocks any other.

use jira_client::retry::retry_with_backoff;
use log::warn;
use serde_json::{Map, Value};

use crate::lark::{SinkClient, SinkError, MAX_RECORDS_PER_REQUEST};

const MIN_BATCH_SIZE: usize = 1;
/// Per-attempt retries for a single batch (or row) at its current size,
/// before that size itself is judged to be the problem.
const RETRIES_PER_SIZE: u32 = 2;

/// Chunk caps applied when the average row in a create batch looks wide
/// enough to risk tripping the sink's request-size limit well under the
/// hard 500-row cap.
const WIDE_FIELD_COUNT: f64 = 20.0;
const WIDE_PAYLOAD_CHARS: f64 = 2000.0;
const WIDE_CHUNK_CAP: usize = 200;
const MODERATE_FIELD_COUNT: f64 = 10.0;
const MODERATE_PAYLOAD_CHARS: f64 = 1000.0;
const MODERATE_CHUNK_CAP: usize = 350;
/// How many of the next pending items to sample when estimating average
/// width; sampling the whole remaining set on every chunk would be
/// quadratic for a large backlog.
const WIDTH_SAMPLE_SIZE: usize = 50;

pub struct BatchProcessor<'a, C: SinkClient> {
    sink: &'a C,
    create_batch_size: usize,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// `(issue_key, sink_row_id)` for every record the sink accepted.
    pub created: Vec<(String, String)>,
    /// Issue keys successfully updated.
    pub updated: Vec<String>,
    /// Issue keys whose update failed because the sink no longer has that
    /// row (`SinkError::RecordNotFound`) — distinct from an ordinary
    /// failure because it means the whole table's ProcessingLog is stale,
    /// not just this one row.
    pub stale: Vec<String>,
    /// Issue keys that could not be synced even as a batch of one, with a
    /// message describing why. Stored as text rather than [`SyncError`]
    /// because a single batch failure fans out across every issue in that
    /// batch, and the underlying sink error isn't `Clone`.
    pub failed: Vec<(String, String)>,
}

impl<'a, C: SinkClient> BatchProcessor<'a, C> {
    pub fn new(sink: &'a C) -> Self {
        Self {
            sink,
            create_batch_size: MAX_RECORDS_PER_REQUEST,
        }
    }

    pub async fn create_all(
        &mut self,
        workspace_token: &str,
        table_id: &str,
        items: Vec<(String, Map<String, Value>)>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut remaining = items;

        while !remaining.is_empty() {
            let cap = proactive_chunk_cap(self.create_batch_size, &remaining);
            let take = cap.min(remaining.len());
            let chunk: Vec<(String, Map<String, Value>)> = remaining.drain(..take).collect();

            let fields: Vec<Map<String, Value>> =
                chunk.iter().map(|(_, f)| f.clone()).collect();

            match retry_with_backoff(RETRIES_PER_SIZE, || {
                self.sink.create_records(workspace_token, table_id, fields.clone())
            })
            .await
            {
                Ok(row_ids) if row_ids.len() == chunk.len() => {
                    outcome.created.extend(
                        chunk.into_iter().map(|(key, _)| key).zip(row_ids),
                    );
                }
                Ok(row_ids) => {
                    warn!(
                        "sink returned {} row ids for a batch of {}; discarding the mismatched batch",
                        row_ids.len(),
                        chunk.len()
                    );
                    self.fail_chunk(chunk, &mut outcome, "sink returned a mismatched record count");
                }
                Err(err) if self.create_batch_size > MIN_BATCH_SIZE => {
                    self.create_batch_size = (self.create_batch_size / 2).max(MIN_BATCH_SIZE);
                    warn!(
                        "create batch of {} failed ({err}); shrinking batch size to {}",
                        chunk.len(),
                        self.create_batch_size
                    );
                    remaining.splice(0..0, chunk);
                }
                Err(err) => {
                    let message = err.to_string();
                    for (issue_key, _) in chunk {
                        outcome.failed.push((issue_key, message.clone()));
                    }
                }
            }
        }

        outcome
    }

    /// The sink has no batch update, so each row is its own request,
    /// retried independently: one bad row can't delay or block any other.
    pub async fn update_all(
        &mut self,
        workspace_token: &str,
        table_id: &str,
        items: Vec<(String, String, Map<String, Value>)>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for (issue_key, row_id, fields) in items {
            match retry_with_backoff(RETRIES_PER_SIZE, || {
                self.sink.update_record(workspace_token, table_id, &row_id, fields.clone())
            })
            .await
            {
                Ok(()) => outcome.updated.push(issue_key),
                Err(SinkError::RecordNotFound) => {
                    warn!("{issue_key}: sink row {row_id} no longer exists");
                    outcome.stale.push(issue_key);
                }
                Err(err) => outcome.failed.push((issue_key, err.to_string())),
            }
        }

        outcome
    }

    fn fail_chunk(
        &self,
        chunk: Vec<(String, Map<String, Value>)>,
        outcome: &mut BatchOutcome,
        reason: &str,
    ) {
        for (issue_key, _) in chunk {
            outcome.failed.push((issue_key, reason.to_string()));
        }
    }
}

/// Picks the chunk size to take from the front of `remaining`, applying the
/// reactive cap `current_cap` and then, independently, narrowing it further
/// if a sample of the upcoming rows looks wide enough to risk tripping the
/// sink's request-size limit before hitting the 500-row hard cap.
fn proactive_chunk_cap(current_cap: usize, remaining: &[(String, Map<String, Value>)]) -> usize {
    let sample_len = remaining.len().min(WIDTH_SAMPLE_SIZE);
    if sample_len == 0 {
        return current_cap;
    }
    let sample = &remaining[..sample_len];

    let avg_fields =
        sample.iter().map(|(_, fields)| fields.len()).sum::<usize>() as f64 / sample_len as f64;
    let avg_payload_chars = sample
        .iter()
        .map(|(_, fields)| serde_json::to_string(fields).map(|s| s.len()).unwrap_or(0))
        .sum::<usize>() as f64
        / sample_len as f64;

    let heuristic_cap = if avg_fields >= WIDE_FIELD_COUNT || avg_payload_chars >= WIDE_PAYLOAD_CHARS {
        WIDE_CHUNK_CAP
    } else if avg_fields >= MODERATE_FIELD_COUNT || avg_payload_chars >= MODERATE_PAYLOAD_CHARS {
        MODERATE_CHUNK_CAP
    } else {
        current_cap
    };

    current_cap.min(heuristic_cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lark::{SinkError, SinkUser};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSink {
        max_batch: usize,
        create_calls: AtomicUsize,
        not_found_rows: Vec<String>,
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
            records: Vec<Map<String, Value>>,
        ) -> Result<Vec<String>, SinkError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if records.len() > self.max_batch {
                return Err(SinkError::ClientError {
                    status: 400,
                    body: "batch too large".to_string(),
                });
            }
            Ok((0..records.len()).map(|i| format!("row_{i}")).collect())
        }

        async fn update_record(
            &self,
            _workspace_token: &str,
            _table_id: &str,
            row_id: &str,
            _fields: Map<String, Value>,
        ) -> Result<(), SinkError> {
            if self.not_found_rows.iter().any(|r| r == row_id) {
                return Err(SinkError::RecordNotFound);
            }
            Ok(())
        }

        async fn lookup_user_by_email(&self, _email: &str) -> Result<Option<SinkUser>, SinkError> {
            Ok(None)
        }
    }

    impl FakeSink {
        fn new(max_batch: usize) -> Self {
            Self {
                max_batch,
                create_calls: AtomicUsize::new(0),
                not_found_rows: Vec::new(),
            }
        }
    }

    fn item(key: &str) -> (String, Map<String, Value>) {
        (key.to_string(), Map::new())
    }

    #[tokio::test]
    async fn shrinks_batch_size_on_rejection_then_succeeds() {
        let sink = FakeSink::new(2);
        let mut processor = BatchProcessor::new(&sink);
        processor.create_batch_size = 4;

        let items = vec![item("TP-1"), item("TP-2"), item("TP-3"), item("TP-4")];
        let outcome = processor.create_all("ws", "tbl", items).await;

        assert_eq!(outcome.created.len(), 4);
        assert!(outcome.failed.is_empty());
        assert_eq!(processor.create_batch_size, 2);
    }

    #[tokio::test]
    async fn batch_of_one_that_still_fails_is_reported_per_issue() {
        let sink = FakeSink::new(0);
        let mut processor = BatchProcessor::new(&sink);
        processor.create_batch_size = 2;

        let outcome = processor
            .create_all("ws", "tbl", vec![item("TP-1"), item("TP-2")])
            .await;

        assert!(outcome.created.is_empty());
        assert_eq!(outcome.failed.len(), 2);
    }

    #[tokio::test]
    async fn wide_rows_are_capped_below_the_hard_limit() {
        let sink = FakeSink::new(usize::MAX);
        let mut processor = BatchProcessor::new(&sink);

        let mut wide = Map::new();
        for i in 0..25 {
            wide.insert(format!("field_{i}"), Value::String("x".repeat(50)));
        }
        let items: Vec<_> = (0..300).map(|i| (format!("TP-{i}"), wide.clone())).collect();

        let outcome = processor.create_all("ws", "tbl", items).await;

        assert_eq!(outcome.created.len(), 300);
        assert_eq!(sink.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_stale_update_does_not_block_the_others() {
        let sink = FakeSink {
            not_found_rows: vec!["row_stale".to_string()],
            ..FakeSink::new(usize::MAX)
        };
        let mut processor = BatchProcessor::new(&sink);

        let items = vec![
            ("TP-1".to_string(), "row_stale".to_string(), Map::new()),
            ("TP-2".to_string(), "row_ok".to_string(), Map::new()),
        ];
        let outcome = processor.update_all("ws", "tbl", items).await;

        assert_eq!(outcome.stale, vec!["TP-1".to_string()]);
        assert_eq!(outcome.updated, vec!["TP-2".to_string()]);
        assert!(outcome.failed.is_empty());
    }
}
