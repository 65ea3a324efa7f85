//! Common types used throughout the sync core.

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Wire format used by the remote ERP for `create_date`/`write_date`.
pub const SERVER_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Opaque remote record identifier.
pub type RecordId = i64;

/// A named class of synced record (e.g. "res.partner", "sale.order").
///
/// Each entity type syncs independently with its own local table and
/// checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create an entity type from a remote model name.
    ///
    /// # Errors
    /// - Empty names and names with characters outside `[A-Za-z0-9._-]`
    ///   are rejected.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity type cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(crate::Error::InvalidInput(format!(
                "Entity type '{}' contains invalid characters",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the remote model name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic local table name: lowercase, separator punctuation
    /// replaced with underscores ("res.partner" -> "res_partner").
    pub fn table_name(&self) -> String {
        self.0
            .to_ascii_lowercase()
            .chars()
            .map(|c| if matches!(c, '.' | '-') { '_' } else { c })
            .collect()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned timestamp in the ERP wire format.
///
/// `write_date` values of this type are the sole trustworthy ordering
/// signal for "has this record changed since last sync".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerTimestamp(NaiveDateTime);

impl ServerTimestamp {
    /// Current wall clock in server format resolution (seconds).
    pub fn now() -> Self {
        let now = Utc::now().naive_utc();
        // Truncate sub-second precision to match the wire format.
        Self(now.with_nanosecond_zero())
    }

    /// Parse from the ERP wire format.
    pub fn parse(s: &str) -> crate::Result<Self> {
        NaiveDateTime::parse_from_str(s, SERVER_DATETIME_FORMAT)
            .map(Self)
            .map_err(|e| {
                crate::Error::InvalidInput(format!("Invalid server timestamp '{}': {}", s, e))
            })
    }

    /// Underlying naive datetime.
    pub fn inner(&self) -> NaiveDateTime {
        self.0
    }

    /// Timestamp shifted back by the given number of days (time-window
    /// retention filters).
    pub fn days_ago(days: u32) -> Self {
        let now = Utc::now().naive_utc() - chrono::Duration::days(i64::from(days));
        Self(now.with_nanosecond_zero())
    }
}

trait TruncateNanos {
    fn with_nanosecond_zero(self) -> NaiveDateTime;
}

impl TruncateNanos for NaiveDateTime {
    fn with_nanosecond_zero(self) -> NaiveDateTime {
        use chrono::Timelike;
        self.with_nanosecond(0).unwrap_or(self)
    }
}

impl fmt::Display for ServerTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(SERVER_DATETIME_FORMAT))
    }
}

impl FromStr for ServerTimestamp {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ServerTimestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServerTimestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A dynamic entity record: field name to value mapping.
///
/// The field set is discovered per entity type at runtime rather than
/// fixed at compile time; strongly-typed views belong in adapter layers
/// outside the sync core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from a JSON object value.
    ///
    /// # Errors
    /// - Non-object values are rejected.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(crate::Error::Serialization(format!(
                "Expected JSON object for record, got {}",
                other
            ))),
        }
    }

    /// Set a field value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> &mut Self {
        self.0.insert(field.into(), value);
        self
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The remote identifier, when present.
    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id").and_then(Value::as_i64)
    }

    /// The server-assigned change timestamp, when present and parseable.
    pub fn write_date(&self) -> Option<ServerTimestamp> {
        self.0
            .get("write_date")
            .and_then(Value::as_str)
            .and_then(|s| ServerTimestamp::parse(s).ok())
    }

    /// Iterate fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Field names present on this record.
    pub fn field_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Consume into the underlying map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
