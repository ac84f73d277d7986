use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single issue as returned by the source tracker's search/get endpoints.
/// `fields` is left as an opaque map; interpreting it is the FieldProcessor's
/// job, not this client's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub key: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum UpdatedFieldError {
    #[error("issue {0} has no `updated` field")]
    Missing(String),
    #[error("issue {0} has a non-string `updated` field")]
    NotAString(String),
    #[error("issue {0} has an unparseable `updated` timestamp: {1}")]
    Unparseable(String, chrono::ParseError),
}

impl Issue {
    /// The monotonic `fields.updated` timestamp this system filters and
    /// orders by.
    pub fn updated(&self) -> Result<DateTime<Utc>, UpdatedFieldError> {
        let raw = self
            .fields
            .get("updated")
            .ok_or_else(|| UpdatedFieldError::Missing(self.key.clone()))?;

        let raw = raw
            .as_str()
            .ok_or_else(|| UpdatedFieldError::NotAString(self.key.clone()))?;

        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| UpdatedFieldError::Unparseable(self.key.clone(), e))
    }
}

/// Deduplicates a batch of issues by `key`, keeping the entry with the
/// greatest `fields.updated` for each key. Defensive against the source
/// tracker paginating duplicate rows during concurrent mutation.
pub fn dedup_by_max_updated(issues: Vec<Issue>) -> Vec<Issue> {
    let mut by_key: hashbrown::HashMap<String, Issue> = hashbrown::HashMap::with_capacity(issues.len());

    for issue in issues {
        let updated = issue.updated().ok();
        match by_key.entry(issue.key.clone()) {
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(issue);
            }
            hashbrown::hash_map::Entry::Occupied(mut slot) => {
                let existing_updated = slot.get().updated().ok();
                if updated > existing_updated {
                    slot.insert(issue);
                }
            }
        }
    }

    by_key.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue(key: &str, updated: &str) -> Issue {
        Issue {
            key: key.to_string(),
            fields: json!({ "updated": updated }).as_object().unwrap().clone(),
        }
    }

    #[test]
    fn keeps_greatest_updated_per_key() {
        let issues = vec![
            issue("TP-1", "2024-07-09T15:30:00+08:00"),
            issue("TP-1", "2024-07-09T16:00:00+08:00"),
            issue("TP-2", "2024-07-09T10:00:00+08:00"),
        ];

        let mut deduped = dedup_by_max_updated(issues);
        deduped.sort_by(|a, b| a.key.cmp(&b.key));

        assert_eq!(deduped.len(), 2);
        assert_eq!(
            deduped[0].fields["updated"],
            json!("2024-07-09T16:00:00+08:00")
        );
    }
}
