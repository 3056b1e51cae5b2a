//! Cross-chat message identity.
//!
//! Every relayed message gets a record keyed by (target chat, source chat,
//! origin message id) holding the id the target chat assigned to the copy.
//! Edits, replies, pins and deletes in the source chat are resolved through
//! these records.

pub mod libsql_backend;
pub mod migrations;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::platform::{ChatId, MessageId};

pub use libsql_backend::LibSqlCorrelationStore;

/// Key of a correlation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub target: ChatId,
    pub source: ChatId,
    pub origin: MessageId,
}

impl CorrelationKey {
    pub fn new(target: ChatId, source: ChatId, origin: MessageId) -> Self {
        Self {
            target,
            source,
            origin,
        }
    }
}

/// Value of a correlation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The origin message was relayed and got this id in the target chat.
    Relayed(MessageId),
    /// A direction gate denied the relay. Nothing exists in the target chat.
    Suppressed,
}

/// Durable correlation mapping.
///
/// Implementations serialize their mutations so a delete never interleaves
/// with an upsert of the same key.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Record (or replace) the destination id for `key`.
    async fn put(&self, key: CorrelationKey, dest: MessageId) -> Result<(), DatabaseError>;

    /// Record a pass-through marker. Never overwrites an existing record.
    async fn mark_suppressed(&self, key: CorrelationKey) -> Result<(), DatabaseError>;

    async fn lookup(&self, key: CorrelationKey) -> Result<Option<Correlation>, DatabaseError>;

    /// Destination id for `key`; suppressed markers count as absent.
    async fn get(&self, key: CorrelationKey) -> Result<Option<MessageId>, DatabaseError> {
        Ok(match self.lookup(key).await? {
            Some(Correlation::Relayed(dest)) => Some(dest),
            _ => None,
        })
    }

    /// Remove every record for an origin message and return the relayed
    /// `(target, dest)` pairs. Suppressed markers are removed silently.
    async fn delete_by_origin(
        &self,
        source: ChatId,
        origin: MessageId,
    ) -> Result<Vec<(ChatId, MessageId)>, DatabaseError>;

    /// Like `delete_by_origin` when the origin chat is unknown.
    async fn delete_by_origin_any_source(
        &self,
        origin: MessageId,
    ) -> Result<Vec<(ChatId, MessageId)>, DatabaseError>;

    /// All records, ordered by key.
    async fn entries(&self) -> Result<Vec<(CorrelationKey, Correlation)>, DatabaseError>;

    async fn is_empty(&self) -> Result<bool, DatabaseError>;

    /// Render every record in the nested-map file format.
    async fn export_json(&self) -> Result<String, DatabaseError> {
        render_export(&self.entries().await?)
    }

    /// Load records from the nested-map file format. Returns the number imported.
    async fn import_json(&self, json: &str) -> Result<usize, DatabaseError> {
        let entries = parse_export(json)?;
        for (key, value) in &entries {
            match value {
                Correlation::Relayed(dest) => self.put(*key, *dest).await?,
                Correlation::Suppressed => self.mark_suppressed(*key).await?,
            }
        }
        Ok(entries.len())
    }
}

type ExportMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, i64>>>;

/// `target -> source -> { origin: dest }`. Suppressed markers map the origin
/// to itself.
pub fn render_export(entries: &[(CorrelationKey, Correlation)]) -> Result<String, DatabaseError> {
    let mut map = ExportMap::new();
    for (key, value) in entries {
        let dest = match value {
            Correlation::Relayed(dest) => *dest,
            Correlation::Suppressed => key.origin,
        };
        map.entry(key.target.to_string())
            .or_default()
            .entry(key.source.to_string())
            .or_default()
            .insert(key.origin.to_string(), dest);
    }
    serde_json::to_string_pretty(&map).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Inverse of [`render_export`]. An origin mapped to itself reads back as
/// `Suppressed`.
///
/// The nested-map layout cannot tell a pass-through marker from a real relay
/// whose destination id happens to equal the origin id. Such a relay imports
/// as `Suppressed`, so later edits, replies and deletes of that one message
/// are not followed.
pub fn parse_export(json: &str) -> Result<Vec<(CorrelationKey, Correlation)>, DatabaseError> {
    let map: ExportMap =
        serde_json::from_str(json).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let parse_id = |raw: &str| {
        raw.parse::<i64>()
            .map_err(|e| DatabaseError::Serialization(format!("bad id {raw:?}: {e}")))
    };

    let mut entries = Vec::new();
    for (target, sources) in &map {
        let target = parse_id(target)?;
        for (source, origins) in sources {
            let source = parse_id(source)?;
            for (origin, dest) in origins {
                let origin = parse_id(origin)?;
                let value = if *dest == origin {
                    Correlation::Suppressed
                } else {
                    Correlation::Relayed(*dest)
                };
                entries.push((CorrelationKey::new(target, source, origin), value));
            }
        }
    }
    Ok(entries)
}
