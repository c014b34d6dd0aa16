//! Schema Index
//!
//! Point-in-time, read-only description of the database's tables and columns. Snapshots
//! are immutable once captured; a refresh produces a new snapshot with a new version.

use crate::error::{CopilotError, Result};
use crate::execution::engine::DatabaseCapability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnMetadata>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// A table, or a column qualified by its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaElement {
    Table {
        table: String,
    },
    Column {
        table: String,
        column: String,
        data_type: String,
    },
}

impl SchemaElement {
    /// `table` or `table.column`
    pub fn qualified_name(&self) -> String {
        match self {
            SchemaElement::Table { table } => table.clone(),
            SchemaElement::Column { table, column, .. } => format!("{}.{}", table, column),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            SchemaElement::Table { table } | SchemaElement::Column { table, .. } => table,
        }
    }

    /// Text handed to the embedding model. Underscores are spelled out so that
    /// `customer_id` shares vocabulary with "customer".
    pub fn embedding_text(&self) -> String {
        match self {
            SchemaElement::Table { table } => {
                format!("Table: {}. {}", table, table.replace('_', " "))
            }
            SchemaElement::Column {
                table,
                column,
                data_type,
            } => format!(
                "Column: {}.{}. {}. Type: {}",
                table,
                column,
                column.replace('_', " "),
                data_type
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Content fingerprint; equal versions mean equal schemas.
    pub version: String,
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<Table>,
    /// The [`SchemaIndex`] that captured this snapshot. A newer snapshot from the same
    /// origin supersedes this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<Table>) -> Self {
        let version = fingerprint(&tables);
        Self {
            version,
            captured_at: Utc::now(),
            tables,
            origin: None,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let tables: Vec<Table> = match serde_json::from_str::<SchemaSnapshot>(&content) {
            Ok(snapshot) => snapshot.tables,
            Err(_) => serde_json::from_str(&content)?,
        };
        Ok(Self::new(tables))
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Every table followed by its columns, in snapshot order.
    pub fn elements(&self) -> Vec<SchemaElement> {
        let mut elements = Vec::new();
        for table in &self.tables {
            elements.push(SchemaElement::Table {
                table: table.name.clone(),
            });
            for column in &table.columns {
                elements.push(SchemaElement::Column {
                    table: table.name.clone(),
                    column: column.name.clone(),
                    data_type: column.data_type.clone(),
                });
            }
        }
        elements
    }

    pub fn contains_qualified(&self, qualified: &str) -> bool {
        match qualified.split_once('.') {
            Some((table, column)) => self
                .table(table)
                .map(|t| t.column(column).is_some())
                .unwrap_or(false),
            None => self.table(qualified).is_some(),
        }
    }

    /// All table names and qualified column names, used for closest-name suggestions.
    pub fn qualified_names(&self) -> Vec<String> {
        self.elements().iter().map(|e| e.qualified_name()).collect()
    }
}

/// True when the two snapshots describe different schemas.
pub fn diff(old: &SchemaSnapshot, new: &SchemaSnapshot) -> bool {
    old.version != new.version
}

fn fingerprint(tables: &[Table]) -> String {
    let mut sorted: Vec<&Table> = tables.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for table in sorted {
        hasher.update(table.name.as_bytes());
        hasher.update([0u8]);
        for column in &table.columns {
            hasher.update(column.name.as_bytes());
            hasher.update([1u8]);
            hasher.update(column.data_type.as_bytes());
            hasher.update([if column.nullable { 2u8 } else { 3u8 }]);
        }
        hasher.update([4u8]);
    }
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Introspect the database. Any failure surfaces as `SchemaUnavailable`.
pub async fn load(db: &dyn DatabaseCapability) -> Result<SchemaSnapshot> {
    let tables = db.list_tables().await.map_err(|e| match e {
        CopilotError::SchemaUnavailable(msg) => CopilotError::SchemaUnavailable(msg),
        other => CopilotError::SchemaUnavailable(other.to_string()),
    })?;
    Ok(SchemaSnapshot::new(tables))
}

/// Holds the current snapshot for a database and refreshes it on demand.
pub struct SchemaIndex {
    id: Uuid,
    db: Arc<dyn DatabaseCapability>,
    current: RwLock<Option<Arc<SchemaSnapshot>>>,
}

impl SchemaIndex {
    pub fn new(db: Arc<dyn DatabaseCapability>) -> Self {
        Self {
            id: Uuid::new_v4(),
            db,
            current: RwLock::new(None),
        }
    }

    /// Index over a fixed snapshot, e.g. one loaded from a JSON file.
    pub fn with_snapshot(db: Arc<dyn DatabaseCapability>, mut snapshot: SchemaSnapshot) -> Self {
        let id = Uuid::new_v4();
        snapshot.origin = Some(id);
        Self {
            id,
            db,
            current: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn current(&self) -> Option<Arc<SchemaSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current snapshot, loading it on first use.
    pub async fn snapshot(&self) -> Result<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }
        let (snapshot, _) = self.refresh().await?;
        Ok(snapshot)
    }

    /// Re-introspect. Returns the snapshot in effect and whether it changed.
    /// An unchanged schema keeps the previous snapshot (and its version).
    pub async fn refresh(&self) -> Result<(Arc<SchemaSnapshot>, bool)> {
        let mut fresh = match load(self.db.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Schema introspection failed: {}", e);
                return Err(e);
            }
        };

        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = guard.as_ref() {
            if !diff(existing, &fresh) {
                return Ok((Arc::clone(existing), false));
            }
        }

        info!(
            "Schema snapshot {} captured ({} tables)",
            fresh.version,
            fresh.tables.len()
        );
        fresh.origin = Some(self.id);
        let fresh = Arc::new(fresh);
        *guard = Some(Arc::clone(&fresh));
        Ok((fresh, true))
    }
}
