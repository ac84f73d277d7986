//! Field projection: turns an [`Issue`]'s opaque `fields` map into the
//! column values the sink table expects, per a configured [`Schema`].
//!
//! Projection never fails the whole issue over one bad field. A field whose
//! source path is absent, or whose shape doesn't match its processor, is
//! logged and left out of the row rather than aborting the cycle — matching
//! the "best-effort replication, never block on one malformed issue" shape
//! the rest of this pipeline follows.

use hashbrown::HashMap;
use jira_client::Issue;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::IssueLinkRule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "processor", rename_all = "snake_case")]
pub enum FieldProcessorKind {
    /// Copy the value at `source_path` unchanged.
    Simple,
    /// Navigate to `source_path`, then drill into `path` within it (e.g. a
    /// `status` field down to its `name`).
    Nested { path: String },
    /// Extract a user identifier at `source_path` for later resolution by
    /// the UserMapper; never resolved inline.
    User,
    /// Parse an ISO-8601 timestamp into epoch milliseconds.
    Datetime,
    /// Join an array of `{name}` objects (components) into a single string.
    Components,
    /// Join an array of `{name}` objects (fix/affects versions).
    Versions,
    /// Render `issuelinks` as `"TYPE: KEY"` lines, optionally filtered to
    /// link-type names starting with one of `prefix_filter`.
    Links { prefix_filter: Option<Vec<String>> },
    /// Build a hyperlink back to the source issue.
    TicketHyperlink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub source_path: String,
    pub sink_column: String,
    #[serde(flatten)]
    pub processor: FieldProcessorKind,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub entries: Vec<SchemaEntry>,
}

impl Schema {
    /// Combines the legacy inline `jira_to_lark` map (always `Simple`) with
    /// the richer schema-file entries. File entries are appended after the
    /// inline ones and win on a `sink_column` collision, since the file form
    /// is the more specific of the two.
    pub fn build(inline: &HashMap<String, String>, file_entries: Vec<SchemaEntry>) -> Self {
        let mut by_column: HashMap<String, SchemaEntry> = HashMap::new();

        for (source_path, sink_column) in inline {
            by_column.insert(
                sink_column.clone(),
                SchemaEntry {
                    source_path: source_path.clone(),
                    sink_column: sink_column.clone(),
                    processor: FieldProcessorKind::Simple,
                },
            );
        }

        for entry in file_entries {
            by_column.insert(entry.sink_column.clone(), entry);
        }

        Self {
            entries: by_column.into_values().collect(),
        }
    }
}

/// A projected field value, pending user resolution for `User`-processed
/// columns. Kept separate from plain JSON because resolving a username into
/// a sink user record happens later, in one batched pass across the whole
/// cycle rather than per-field here.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedValue {
    Value(Value),
    UserRef(String),
}

#[derive(Debug, Clone, Default)]
pub struct ProjectedIssue {
    pub issue_key: String,
    pub columns: Vec<(String, ProjectedValue)>,
}

pub struct FieldProcessor<'a> {
    schema: &'a Schema,
    link_rules: &'a HashMap<String, IssueLinkRule>,
    source_base_url: &'a str,
}

impl<'a> FieldProcessor<'a> {
    pub fn new(
        schema: &'a Schema,
        link_rules: &'a HashMap<String, IssueLinkRule>,
        source_base_url: &'a str,
    ) -> Self {
        Self {
            schema,
            link_rules,
            source_base_url,
        }
    }

    pub fn project(&self, issue: &Issue) -> ProjectedIssue {
        let mut columns = Vec::with_capacity(self.schema.entries.len());

        for entry in &self.schema.entries {
            match self.project_one(issue, entry) {
                Some(value) => columns.push((entry.sink_column.clone(), value)),
                None => warn!(
                    "{}: skipping column {} ({:?}): source path {} absent or malformed",
                    issue.key, entry.sink_column, entry.processor, entry.source_path
                ),
            }
        }

        ProjectedIssue {
            issue_key: issue.key.clone(),
            columns,
        }
    }

    fn project_one(&self, issue: &Issue, entry: &SchemaEntry) -> Option<ProjectedValue> {
        match &entry.processor {
            FieldProcessorKind::Simple => {
                navigate(&issue.fields, &entry.source_path).map(|v| ProjectedValue::Value(v.clone()))
            }
            FieldProcessorKind::Nested { path } => {
                let base = navigate(&issue.fields, &entry.source_path)?;
                let nested = navigate_value(base, path)?;
                Some(ProjectedValue::Value(nested.clone()))
            }
            FieldProcessorKind::User => {
                let base = navigate(&issue.fields, &entry.source_path)?;
                user_identifier(base).map(ProjectedValue::UserRef)
            }
            FieldProcessorKind::Datetime => {
                let raw = navigate(&issue.fields, &entry.source_path)?.as_str()?;
                let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
                Some(ProjectedValue::Value(Value::from(
                    parsed.timestamp_millis(),
                )))
            }
            FieldProcessorKind::Components | FieldProcessorKind::Versions => {
                let base = navigate(&issue.fields, &entry.source_path)?;
                let array = base.as_array()?;
                let mut names: Vec<&str> = array.iter().filter_map(|v| v.get("name")?.as_str()).collect();
                names.sort_unstable();
                names.dedup();
                Some(ProjectedValue::Value(Value::from(names.join(", "))))
            }
            FieldProcessorKind::Links { prefix_filter } => {
                let base = navigate(&issue.fields, &entry.source_path)?;
                let array = base.as_array()?;
                let lines = self.render_links(array, prefix_filter.as_deref());
                Some(ProjectedValue::Value(Value::from(lines.join("\n"))))
            }
            FieldProcessorKind::TicketHyperlink => Some(ProjectedValue::Value(serde_json::json!({
                "text": issue.key,
                "link": format!("{}/browse/{}", self.source_base_url.trim_end_matches('/'), issue.key),
            }))),
        }
    }

    fn render_links(&self, links: &[Value], prefix_filter: Option<&[String]>) -> Vec<String> {
        let mut lines = Vec::new();

        for link in links {
            let Some((type_name, key)) = link_target(link) else {
                continue;
            };

            if let Some(allowed) = prefix_filter {
                if !allowed.iter().any(|p| type_name.starts_with(p.as_str())) {
                    continue;
                }
            } else if !self.link_rules.is_empty() {
                let passes = self.link_rules.values().any(|rule| {
                    rule.display_link_prefixes
                        .iter()
                        .any(|p| type_name.starts_with(p.as_str()))
                });
                if !passes {
                    continue;
                }
            }

            lines.push(format!("{type_name}: {key}"));
        }

        lines
    }
}

fn navigate<'v>(fields: &'v serde_json::Map<String, Value>, path: &str) -> Option<&'v Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut value = fields.get(first)?;
    for segment in segments {
        value = value.get(segment)?;
    }
    Some(value)
}

fn navigate_value<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// JIRA-like trackers identify a user by `name`, `accountId`, or
/// `emailAddress` depending on deployment; the UserMapper treats whichever
/// is present as the lookup key.
fn user_identifier(value: &Value) -> Option<String> {
    value
        .get("accountId")
        .or_else(|| value.get("name"))
        .or_else(|| value.get("emailAddress"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn link_target(link: &Value) -> Option<(&str, &str)> {
    if let Some(inward) = link.get("inwardIssue") {
        let type_name = link.get("type")?.get("inward")?.as_str()?;
        let key = inward.get("key")?.as_str()?;
        return Some((type_name, key));
    }
    if let Some(outward) = link.get("outwardIssue") {
        let type_name = link.get("type")?.get("outward")?.as_str()?;
        let key = outward.get("key")?.as_str()?;
        return Some((type_name, key));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue(fields: Value) -> Issue {
        Issue {
            key: "TP-1".to_string(),
            fields: fields.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn simple_copies_value() {
        let schema = Schema {
            entries: vec![SchemaEntry {
                source_path: "summary".to_string(),
                sink_column: "Summary".to_string(),
                processor: FieldProcessorKind::Simple,
            }],
        };
        let rules = HashMap::new();
        let processor = FieldProcessor::new(&schema, &rules, "https://jira.example.com");
        let projected = processor.project(&issue(json!({ "summary": "Fix the thing" })));

        assert_eq!(
            projected.columns,
            vec![(
                "Summary".to_string(),
                ProjectedValue::Value(json!("Fix the thing"))
            )]
        );
    }

    #[test]
    fn nested_drills_into_object() {
        let schema = Schema {
            entries: vec![SchemaEntry {
                source_path: "status".to_string(),
                sink_column: "Status".to_string(),
                processor: FieldProcessorKind::Nested {
                    path: "name".to_string(),
                },
            }],
        };
        let rules = HashMap::new();
        let processor = FieldProcessor::new(&schema, &rules, "https://jira.example.com");
        let projected = processor.project(&issue(json!({ "status": { "name": "In Progress" } })));

        assert_eq!(
            projected.columns,
            vec![("Status".to_string(), ProjectedValue::Value(json!("In Progress")))]
        );
    }

    #[test]
    fn user_processor_extracts_identifier_for_later_resolution() {
        let schema = Schema {
            entries: vec![SchemaEntry {
                source_path: "assignee".to_string(),
                sink_column: "Assignee".to_string(),
                processor: FieldProcessorKind::User,
            }],
        };
        let rules = HashMap::new();
        let processor = FieldProcessor::new(&schema, &rules, "https://jira.example.com");
        let projected =
            processor.project(&issue(json!({ "assignee": { "name": "jdoe" } })));

        assert_eq!(
            projected.columns,
            vec![("Assignee".to_string(), ProjectedValue::UserRef("jdoe".to_string()))]
        );
    }

    #[test]
    fn missing_source_path_is_skipped_not_fatal() {
        let schema = Schema {
            entries: vec![SchemaEntry {
                source_path: "nonexistent".to_string(),
                sink_column: "Nope".to_string(),
                processor: FieldProcessorKind::Simple,
            }],
        };
        let rules = HashMap::new();
        let processor = FieldProcessor::new(&schema, &rules, "https://jira.example.com");
        let projected = processor.project(&issue(json!({})));

        assert!(projected.columns.is_empty());
    }

    #[test]
    fn components_joins_sorted_unique_names() {
        let schema = Schema {
            entries: vec![SchemaEntry {
                source_path: "components".to_string(),
                sink_column: "Components".to_string(),
                processor: FieldProcessorKind::Components,
            }],
        };
        let rules = HashMap::new();
        let processor = FieldProcessor::new(&schema, &rules, "https://jira.example.com");
        let projected = processor.project(&issue(json!({
            "components": [{ "name": "backend" }, { "name": "api" }, { "name": "backend" }]
        })));

        assert_eq!(
            projected.columns,
            vec![("Components".to_string(), ProjectedValue::Value(json!("api, backend")))]
        );
    }

    #[test]
    fn ticket_hyperlink_points_back_to_source() {
        let schema = Schema {
            entries: vec![SchemaEntry {
                source_path: "".to_string(),
                sink_column: "Ticket".to_string(),
                processor: FieldProcessorKind::TicketHyperlink,
            }],
        };
        let rules = HashMap::new();
        let processor = FieldProcessor::new(&schema, &rules, "https://jira.example.com/");
        let projected = processor.project(&issue(json!({})));

        assert_eq!(
            projected.columns,
            vec![(
                "Ticket".to_string(),
                ProjectedValue::Value(json!({
                    "text": "TP-1",
                    "link": "https://jira.example.com/browse/TP-1",
                }))
            )]
        );
    }
}
