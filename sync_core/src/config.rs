//! Configuration loading: layered
//! `Figment::from(Serialized::defaults(...)).merge(Toml::file(...)).merge(Env::prefixed(...))`,
//! built-in defaults, then the config file, then environment overrides.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use hashbrown::{HashMap, HashSet};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::schema::SchemaEntry;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("error loading configuration")]
    FigmentError(#[from] figment::Error),

    #[error("error reading schema file {path}")]
    SchemaFileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing schema file {path}")]
    SchemaFileParseError {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error(
        "table {team}/{table} is enabled but no identity column candidate was configured"
    )]
    MissingIdentityCandidates { team: String, table: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSection {
    pub log_level: String,
    pub default_sync_interval: u64,
    pub data_directory: String,
}

impl Default for GlobalSection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_sync_interval: 15 * 60,
            data_directory: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceSection {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub ca_cert_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SinkSection {
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldMappingsSection {
    #[serde(default)]
    pub ticket_fields: Vec<String>,
    /// Legacy inline form: source field path -> sink column name, always a
    /// `Simple` processor. The newer form is a schema file with a processor
    /// tag per entry; both describe the same thing per spec.
    #[serde(default)]
    pub jira_to_lark: HashMap<String, String>,
    /// Path to the newer schema-file form, relative to the config file's
    /// directory when not absolute.
    pub schema_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueLinkRule {
    #[serde(default)]
    pub display_link_prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sink_table_id: String,
    pub filter_expression: String,
    pub sync_interval: Option<u64>,
    #[serde(default)]
    pub excluded_fields: Vec<String>,
    pub identity_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sync_interval: Option<u64>,
    pub workspace_token: String,
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub sink: SinkSection,
    #[serde(default)]
    pub field_mappings: FieldMappingsSection,
    #[serde(default)]
    pub issue_link_rules: HashMap<String, IssueLinkRule>,
    #[serde(default)]
    pub teams: HashMap<String, TeamConfig>,
}

impl Config {
    pub fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("SYNC_").split("__"))
    }

    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::figment(config_path).extract()?)
    }

    /// `ca_cert_path` is resolved relative to the config file's directory
    /// when it isn't already absolute.
    pub fn resolved_ca_cert_path(&self, config_path: &Path) -> Option<PathBuf> {
        let raw = self.source.ca_cert_path.as_ref()?;
        let raw_path = PathBuf::from(raw);
        if raw_path.is_absolute() {
            Some(raw_path)
        } else {
            let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
            Some(dir.join(raw_path))
        }
    }

    /// Loads the newer schema-file form, if configured, resolving its path
    /// the same way as `ca_cert_path`.
    pub fn load_schema_file(&self, config_path: &Path) -> Result<Vec<SchemaEntry>, ConfigError> {
        let Some(raw) = &self.field_mappings.schema_file else {
            return Ok(Vec::new());
        };

        let raw_path = PathBuf::from(raw);
        let path = if raw_path.is_absolute() {
            raw_path
        } else {
            let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
            dir.join(raw_path)
        };

        let contents =
            std::fs::read_to_string(&path).map_err(|source| ConfigError::SchemaFileReadError {
                path: path.display().to_string(),
                source,
            })?;

        #[derive(Deserialize)]
        struct SchemaFile {
            #[serde(default)]
            entries: Vec<SchemaEntry>,
        }

        let parsed: SchemaFile =
            toml::from_str(&contents).map_err(|source| ConfigError::SchemaFileParseError {
                path: path.display().to_string(),
                source,
            })?;

        Ok(parsed.entries)
    }

    /// Flattens `teams.*.tables.*` into the binding list the Coordinator
    /// schedules, resolving each binding's effective sync interval
    /// (`table ?? team ?? global.default`) and filtering out disabled
    /// teams/tables.
    pub fn bindings(&self) -> Result<Vec<TableBinding>, ConfigError> {
        let mut bindings = Vec::new();

        for (team_id, team) in &self.teams {
            if !team.enabled {
                continue;
            }

            for (table_key, table) in &team.tables {
                if !table.enabled {
                    continue;
                }

                let candidates: Vec<String> = table
                    .identity_field
                    .clone()
                    .into_iter()
                    .chain(self.field_mappings.ticket_fields.iter().cloned())
                    .collect();

                if candidates.is_empty() {
                    return Err(ConfigError::MissingIdentityCandidates {
                        team: team_id.clone(),
                        table: table_key.clone(),
                    });
                }

                let interval = table
                    .sync_interval
                    .or(team.sync_interval)
                    .unwrap_or(self.global.default_sync_interval);

                bindings.push(TableBinding {
                    team_id: team_id.clone(),
                    table_key: table_key.clone(),
                    workspace_token: team.workspace_token.clone(),
                    sink_table_id: table.sink_table_id.clone(),
                    filter_expression: table.filter_expression.clone(),
                    sync_interval_secs: interval,
                    excluded_fields: table.excluded_fields.iter().cloned().collect(),
                    identity_field_candidates: candidates,
                    identity_column: String::new(),
                });
            }
        }

        Ok(bindings)
    }
}

/// The resolved configuration for one table binding. Unlike `TableConfig`,
/// this always carries a concrete sync interval and the full
/// identity-column candidate list, with every team/table-level override
/// already folded in.
///
/// `identity_column` starts empty here — `Config::bindings` only has the
/// config file to go on, not the sink's live schema. `Runtime::build` fills
/// it in with whichever of `identity_field_candidates` actually exists as a
/// hyperlink-typed column on the table, and refuses to start this binding if
/// none of them do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBinding {
    pub team_id: String,
    pub table_key: String,
    pub workspace_token: String,
    pub sink_table_id: String,
    pub filter_expression: String,
    pub sync_interval_secs: u64,
    pub excluded_fields: HashSet<String>,
    pub identity_field_candidates: Vec<String>,
    pub identity_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingId {
    pub team_id: String,
    pub table_key: String,
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.team_id, self.table_key)
    }
}

impl TableBinding {
    pub fn id(&self) -> BindingId {
        BindingId {
            team_id: self.team_id.clone(),
            table_key: self.table_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_interval_falls_back_table_then_team_then_global() {
        let mut config = Config {
            global: GlobalSection {
                default_sync_interval: 900,
                ..Default::default()
            },
            ..Default::default()
        };

        config.teams.insert(
            "mgmt".to_string(),
            TeamConfig {
                enabled: true,
                sync_interval: Some(600),
                workspace_token: "ws1".to_string(),
                tables: HashMap::from_iter([(
                    "tp".to_string(),
                    TableConfig {
                        enabled: true,
                        sink_table_id: "tbl1".to_string(),
                        filter_expression: "project = TP".to_string(),
                        sync_interval: None,
                        excluded_fields: Vec::new(),
                        identity_field: None,
                    },
                )]),
            },
        );
        config.field_mappings.ticket_fields = vec!["Ticket".to_string()];

        let bindings = config.bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].sync_interval_secs, 600);
    }

    #[test]
    fn disabled_table_is_excluded() {
        let mut config = Config::default();
        config.field_mappings.ticket_fields = vec!["Ticket".to_string()];
        config.teams.insert(
            "mgmt".to_string(),
            TeamConfig {
                enabled: true,
                sync_interval: None,
                workspace_token: "ws1".to_string(),
                tables: HashMap::from_iter([(
                    "tp".to_string(),
                    TableConfig {
                        enabled: false,
                        ..Default::default()
                    },
                )]),
            },
        );

        assert!(config.bindings().unwrap().is_empty());
    }

    #[test]
    fn missing_identity_candidates_is_an_error() {
        let mut config = Config::default();
        config.teams.insert(
            "mgmt".to_string(),
            TeamConfig {
                enabled: true,
                sync_interval: None,
                workspace_token: "ws1".to_string(),
                tables: HashMap::from_iter([(
                    "tp".to_string(),
                    TableConfig {
                        enabled: true,
                        ..Default::default()
                    },
                )]),
            },
        );

        assert!(matches!(
            config.bindings(),
            Err(ConfigError::MissingIdentityCandidates { .. })
        ));
    }
}
