//! In-memory gateway for testing and the demo CLI.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

use erpsync_common::{EntityType, Error, Record, RecordId, Result, ServerTimestamp};

use crate::domain::Domain;
use crate::gateway::{RemoteGateway, SearchOptions};

/// A failure scripted to occur on an upcoming gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Network,
    Timeout,
    RateLimited,
}

impl ScriptedFailure {
    fn into_error(self) -> Error {
        match self {
            ScriptedFailure::Network => Error::Network("scripted connection reset".to_string()),
            ScriptedFailure::Timeout => Error::Timeout("scripted deadline exceeded".to_string()),
            ScriptedFailure::RateLimited => {
                Error::RateLimited("scripted rate limit".to_string())
            }
        }
    }
}

struct Inner {
    records: HashMap<EntityType, BTreeMap<RecordId, Record>>,
    next_id: RecordId,
    /// Logical server clock; advances one second per mutation so
    /// write_date ordering is deterministic in tests.
    clock: NaiveDateTime,
    failures: VecDeque<ScriptedFailure>,
    denied: HashSet<EntityType>,
    unknown_fields: HashMap<EntityType, HashSet<String>>,
    calls: HashMap<&'static str, usize>,
}

impl Inner {
    fn tick(&mut self) -> String {
        self.clock += chrono::Duration::seconds(1);
        self.clock
            .format(erpsync_common::types::SERVER_DATETIME_FORMAT)
            .to_string()
    }
}

/// In-memory remote gateway.
///
/// Holds records per entity type, assigns server ids and write_dates
/// from a logical clock, and supports scripted failures, permission
/// denials, and unknown-field rejections so engine error paths can be
/// exercised without a transport.
#[derive(Clone)]
pub struct MemoryGateway {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryGateway {
    /// Create an empty gateway with the clock at 2024-01-01 00:00:00.
    pub fn new() -> Self {
        let clock =
            NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S")
                .expect("static datetime");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                records: HashMap::new(),
                next_id: 1,
                clock,
                failures: VecDeque::new(),
                denied: HashSet::new(),
                unknown_fields: HashMap::new(),
                calls: HashMap::new(),
            })),
        }
    }

    /// Seed records for an entity type.
    ///
    /// Records without an `id` get a server-assigned one; records
    /// without a `write_date` are stamped from the logical clock.
    pub fn seed(&self, entity_type: &EntityType, records: Vec<Record>) {
        let mut inner = self.inner.lock().expect("gateway lock");
        for mut record in records {
            let id = match record.id() {
                Some(id) => id,
                None => {
                    let id = inner.next_id;
                    record.set("id", json!(id));
                    id
                }
            };
            inner.next_id = inner.next_id.max(id + 1);
            if record.write_date().is_none() {
                let stamp = inner.tick();
                record.set("create_date", json!(stamp.clone()));
                record.set("write_date", json!(stamp));
            }
            inner
                .records
                .entry(entity_type.clone())
                .or_default()
                .insert(id, record);
        }
    }

    /// Apply a server-side edit, advancing the record's write_date.
    ///
    /// Simulates a collaborator's change landing remotely between syncs.
    pub fn server_update(&self, entity_type: &EntityType, id: RecordId, values: Record) {
        let mut inner = self.inner.lock().expect("gateway lock");
        let stamp = inner.tick();
        if let Some(record) = inner
            .records
            .entry(entity_type.clone())
            .or_default()
            .get_mut(&id)
        {
            for (field, value) in values.fields() {
                record.set(field.clone(), value.clone());
            }
            record.set("write_date", json!(stamp));
        }
    }

    /// Remove a record server-side without going through `unlink`.
    pub fn server_delete(&self, entity_type: &EntityType, id: RecordId) {
        let mut inner = self.inner.lock().expect("gateway lock");
        if let Some(table) = inner.records.get_mut(entity_type) {
            table.remove(&id);
        }
    }

    /// Move the logical clock forward.
    pub fn advance_clock(&self, seconds: i64) {
        let mut inner = self.inner.lock().expect("gateway lock");
        inner.clock += chrono::Duration::seconds(seconds);
    }

    /// Script a failure for the next gateway call.
    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.fail_times(1, failure);
    }

    /// Script a failure for the next `n` gateway calls.
    pub fn fail_times(&self, n: usize, failure: ScriptedFailure) {
        let mut inner = self.inner.lock().expect("gateway lock");
        for _ in 0..n {
            inner.failures.push_back(failure);
        }
    }

    /// Deny all access to an entity type.
    pub fn deny(&self, entity_type: &EntityType) {
        let mut inner = self.inner.lock().expect("gateway lock");
        inner.denied.insert(entity_type.clone());
    }

    /// Mark a field as unknown server-side for an entity type; any read
    /// requesting it fails with a schema error.
    pub fn reject_field(&self, entity_type: &EntityType, field: impl Into<String>) {
        let mut inner = self.inner.lock().expect("gateway lock");
        inner
            .unknown_fields
            .entry(entity_type.clone())
            .or_default()
            .insert(field.into());
    }

    /// Number of calls made to the named operation.
    pub fn call_count(&self, op: &str) -> usize {
        let inner = self.inner.lock().expect("gateway lock");
        inner.calls.get(op).copied().unwrap_or(0)
    }

    /// Current write_date of a stored record, if any.
    pub fn write_date_of(
        &self,
        entity_type: &EntityType,
        id: RecordId,
    ) -> Option<ServerTimestamp> {
        let inner = self.inner.lock().expect("gateway lock");
        inner
            .records
            .get(entity_type)
            .and_then(|t| t.get(&id))
            .and_then(Record::write_date)
    }

    /// Raw record access for test assertions.
    pub fn get_record(&self, entity_type: &EntityType, id: RecordId) -> Option<Record> {
        let inner = self.inner.lock().expect("gateway lock");
        inner.records.get(entity_type).and_then(|t| t.get(&id)).cloned()
    }

    fn admit(&self, op: &'static str, entity_type: &EntityType) -> Result<()> {
        let mut inner = self.inner.lock().expect("gateway lock");
        *inner.calls.entry(op).or_insert(0) += 1;
        if let Some(failure) = inner.failures.pop_front() {
            debug!(op, %entity_type, "scripted gateway failure");
            return Err(failure.into_error());
        }
        if inner.denied.contains(entity_type) {
            return Err(Error::PermissionDenied(format!(
                "access to {} denied",
                entity_type
            )));
        }
        Ok(())
    }

    fn check_fields(&self, entity_type: &EntityType, fields: &[String]) -> Result<()> {
        let inner = self.inner.lock().expect("gateway lock");
        if let Some(unknown) = inner.unknown_fields.get(entity_type) {
            if let Some(bad) = fields.iter().find(|f| unknown.contains(*f)) {
                return Err(Error::Schema {
                    field: bad.clone(),
                    message: format!("field does not exist on {}", entity_type),
                });
            }
        }
        Ok(())
    }

    fn matching(&self, entity_type: &EntityType, domain: &Domain) -> Vec<Record> {
        let inner = self.inner.lock().expect("gateway lock");
        inner
            .records
            .get(entity_type)
            .map(|table| {
                table
                    .values()
                    .filter(|r| domain.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_order(records: &mut [Record], order: Option<&str>) {
    let Some(order) = order else { return };
    let mut parts = order.split_whitespace();
    let field = parts.next().unwrap_or("id").to_string();
    let desc = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));

    records.sort_by(|a, b| {
        let av = a.get(&field);
        let bv = b.get(&field);
        let ord = match (av, bv) {
            (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
            (Some(x), Some(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (None, None) => std::cmp::Ordering::Equal,
        };
        if desc {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn paginate(records: Vec<Record>, options: &SearchOptions) -> Vec<Record> {
    let start = options.offset as usize;
    let iter = records.into_iter().skip(start);
    match options.limit {
        Some(limit) => iter.take(limit as usize).collect(),
        None => iter.collect(),
    }
}

fn project(record: &Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record.clone();
    }
    let mut out = Record::new();
    if let Some(id) = record.get("id") {
        out.set("id", id.clone());
    }
    for field in fields {
        if let Some(value) = record.get(field) {
            out.set(field.clone(), value.clone());
        }
    }
    out
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn search(
        &self,
        entity_type: &EntityType,
        domain: &Domain,
        options: &SearchOptions,
    ) -> Result<Vec<RecordId>> {
        self.admit("search", entity_type)?;
        let mut records = self.matching(entity_type, domain);
        apply_order(&mut records, options.order.as_deref());
        Ok(paginate(records, options)
            .iter()
            .filter_map(Record::id)
            .collect())
    }

    async fn search_read(
        &self,
        entity_type: &EntityType,
        domain: &Domain,
        fields: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<Record>> {
        self.admit("search_read", entity_type)?;
        self.check_fields(entity_type, fields)?;
        let mut records = self.matching(entity_type, domain);
        apply_order(&mut records, options.order.as_deref());
        Ok(paginate(records, options)
            .iter()
            .map(|r| project(r, fields))
            .collect())
    }

    async fn read(
        &self,
        entity_type: &EntityType,
        ids: &[RecordId],
        fields: &[String],
    ) -> Result<Vec<Record>> {
        self.admit("read", entity_type)?;
        self.check_fields(entity_type, fields)?;
        let inner = self.inner.lock().expect("gateway lock");
        let Some(table) = inner.records.get(entity_type) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| table.get(id))
            .map(|r| project(r, fields))
            .collect())
    }

    async fn create(&self, entity_type: &EntityType, values: &Record) -> Result<RecordId> {
        self.admit("create", entity_type)?;
        let mut inner = self.inner.lock().expect("gateway lock");
        let id = inner.next_id;
        inner.next_id += 1;
        let stamp = inner.tick();

        let mut record = values.clone();
        record.set("id", json!(id));
        record.set("create_date", json!(stamp.clone()));
        record.set("write_date", json!(stamp));
        inner
            .records
            .entry(entity_type.clone())
            .or_default()
            .insert(id, record);
        Ok(id)
    }

    async fn write(
        &self,
        entity_type: &EntityType,
        ids: &[RecordId],
        values: &Record,
    ) -> Result<bool> {
        self.admit("write", entity_type)?;
        let mut inner = self.inner.lock().expect("gateway lock");
        let stamp = inner.tick();
        let table = inner
            .records
            .entry(entity_type.clone())
            .or_default();
        for id in ids {
            let Some(record) = table.get_mut(id) else {
                return Err(Error::NotFound(format!("{} record {}", entity_type, id)));
            };
            for (field, value) in values.fields() {
                record.set(field.clone(), value.clone());
            }
            record.set("write_date", json!(stamp.clone()));
        }
        Ok(true)
    }

    async fn unlink(&self, entity_type: &EntityType, ids: &[RecordId]) -> Result<bool> {
        self.admit("unlink", entity_type)?;
        let mut inner = self.inner.lock().expect("gateway lock");
        if let Some(table) = inner.records.get_mut(entity_type) {
            for id in ids {
                table.remove(id);
            }
        }
        Ok(true)
    }

    async fn count(&self, entity_type: &EntityType, domain: &Domain) -> Result<u64> {
        self.admit("count", entity_type)?;
        Ok(self.matching(entity_type, domain).len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CompareOp;
    use serde_json::json;

    fn contact() -> EntityType {
        EntityType::new("res.partner").unwrap()
    }

    fn named(name: &str) -> Record {
        Record::from_value(json!({ "name": name })).unwrap()
    }

    #[tokio::test]
    async fn test_seed_assigns_ids_and_write_dates() {
        let gw = MemoryGateway::new();
        gw.seed(&contact(), vec![named("A"), named("B")]);

        let records = gw
            .search_read(&contact(), &Domain::all(), &[], &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.id().is_some()));
        assert!(records.iter().all(|r| r.write_date().is_some()));
    }

    #[tokio::test]
    async fn test_write_advances_write_date() {
        let gw = MemoryGateway::new();
        gw.seed(&contact(), vec![named("A")]);
        let before = gw.write_date_of(&contact(), 1).unwrap();

        let mut values = Record::new();
        values.set("name", json!("A2"));
        gw.write(&contact(), &[1], &values).await.unwrap();

        let after = gw.write_date_of(&contact(), 1).unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed_once() {
        let gw = MemoryGateway::new();
        gw.seed(&contact(), vec![named("A")]);
        gw.fail_next(ScriptedFailure::Timeout);

        let err = gw
            .search_read(&contact(), &Domain::all(), &[], &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Next call succeeds.
        assert!(gw
            .search_read(&contact(), &Domain::all(), &[], &SearchOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_denied_entity_type() {
        let gw = MemoryGateway::new();
        gw.deny(&contact());
        let err = gw.count(&contact(), &Domain::all()).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_unknown_field_rejected() {
        let gw = MemoryGateway::new();
        gw.seed(&contact(), vec![named("A")]);
        gw.reject_field(&contact(), "x_legacy");

        let err = gw
            .search_read(
                &contact(),
                &Domain::all(),
                &["name".into(), "x_legacy".into()],
                &SearchOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Schema { field, .. } if field == "x_legacy"));
    }

    #[tokio::test]
    async fn test_order_and_pagination() {
        let gw = MemoryGateway::new();
        gw.seed(&contact(), vec![named("A"), named("B"), named("C")]);

        let page = gw
            .search_read(
                &contact(),
                &Domain::all(),
                &[],
                &SearchOptions::default()
                    .with_order("write_date desc")
                    .with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        // Most recently stamped record first.
        assert_eq!(page[0].id(), Some(3));
        assert_eq!(page[1].id(), Some(2));
    }

    #[tokio::test]
    async fn test_projection_always_includes_id() {
        let gw = MemoryGateway::new();
        gw.seed(&contact(), vec![named("A")]);

        let records = gw
            .search_read(
                &contact(),
                &Domain::all(),
                &["name".into()],
                &SearchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(records[0].id(), Some(1));
        assert!(records[0].get("write_date").is_none());
    }

    #[tokio::test]
    async fn test_incremental_domain_filters() {
        let gw = MemoryGateway::new();
        gw.seed(&contact(), vec![named("A"), named("B")]);
        let cutoff = gw.write_date_of(&contact(), 2).unwrap();

        let mut values = Record::new();
        values.set("name", json!("A2"));
        gw.write(&contact(), &[1], &values).await.unwrap();

        let d = Domain::filter("write_date", CompareOp::Gt, json!(cutoff.to_string()));
        let changed = gw
            .search_read(&contact(), &d, &[], &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id(), Some(1));
    }
}
