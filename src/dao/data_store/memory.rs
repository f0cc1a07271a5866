//! In-process data store and change feed.
//!
//! Backs the demo binary and the test suite. Besides plain storage it can
//! inject the failures a remote store exhibits: failed writes, deletes that
//! silently match nothing, refused subscriptions and dropped channels.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dao::{
    data_store::{ChangeEvent, ChangeFeed, ChangeType, DataStore, EventSpec, FeedStatus, FeedSubscription},
    storage::{Filter, Row, StorageError, StorageResult, Table},
};

const EVENT_CAPACITY: usize = 256;

/// Store operation targeted by injected faults and recorded in the mutation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Row reads.
    Query,
    /// Row inserts.
    Insert,
    /// Row patches.
    Update,
    /// Row deletes.
    Delete,
}

/// Successful write recorded by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Kind of call.
    pub operation: Operation,
    /// Table touched.
    pub table: Table,
    /// Filter of updates and deletes.
    pub filter: Option<Filter>,
    /// Inserted row or update patch.
    pub row: Option<Row>,
    /// Number of rows the write touched.
    pub affected: usize,
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    table: Table,
    remaining: u32,
}

struct Inner {
    tables: Mutex<HashMap<Table, IndexMap<String, Row>>>,
    events: broadcast::Sender<ChangeEvent>,
    channels: DashMap<String, watch::Sender<FeedStatus>>,
    faults: Mutex<Vec<Fault>>,
    ignored_deletes: Mutex<HashSet<Table>>,
    failing_subscriptions: AtomicU32,
    healthy: AtomicBool,
    log: Mutex<Vec<Mutation>>,
}

/// Shared in-memory backend implementing both [`DataStore`] and [`ChangeFeed`].
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty, healthy backend.
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(HashMap::new()),
                events,
                channels: DashMap::new(),
                faults: Mutex::new(Vec::new()),
                ignored_deletes: Mutex::new(HashSet::new()),
                failing_subscriptions: AtomicU32::new(0),
                healthy: AtomicBool::new(true),
                log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fail the next `times` calls of `operation` on `table` with an unavailable error.
    pub fn fail_next(&self, operation: Operation, table: Table, times: u32) {
        if times == 0 {
            return;
        }
        self.inner.faults.lock().push(Fault {
            operation,
            table,
            remaining: times,
        });
    }

    /// Make deletes on `table` succeed without removing anything.
    pub fn ignore_deletes(&self, table: Table) {
        self.inner.ignored_deletes.lock().insert(table);
    }

    /// Refuse the next `times` channel subscriptions.
    pub fn fail_subscriptions(&self, times: u32) {
        self.inner
            .failing_subscriptions
            .store(times, Ordering::SeqCst);
    }

    /// Break a live channel as a network drop would.
    pub fn drop_channel(&self, channel: &str) {
        if let Some((_, status)) = self.inner.channels.remove(channel) {
            let _ = status.send(FeedStatus::Error("connection lost".into()));
        }
    }

    /// Toggle store availability.
    pub fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Push an arbitrary event to every subscriber, bypassing storage.
    pub fn inject_event(&self, event: ChangeEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Writes performed so far, oldest first.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.inner.log.lock().clone()
    }

    /// Current rows of `table` in insertion order.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.inner
            .tables
            .lock()
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a channel is currently subscribed.
    pub fn has_channel(&self, channel: &str) -> bool {
        self.inner.channels.contains_key(channel)
    }

    fn check(&self, operation: Operation, table: Table) -> StorageResult<()> {
        if !self.inner.healthy.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                "memory backend is offline".into(),
                io::Error::new(io::ErrorKind::NotConnected, "offline"),
            ));
        }

        let mut faults = self.inner.faults.lock();
        if let Some(position) = faults
            .iter()
            .position(|fault| fault.operation == operation && fault.table == table)
        {
            let fault = &mut faults[position];
            fault.remaining -= 1;
            if fault.remaining == 0 {
                faults.remove(position);
            }
            return Err(StorageError::unavailable(
                format!("injected {operation:?} failure on `{table}`"),
                io::Error::other("injected fault"),
            ));
        }
        Ok(())
    }

    fn record(&self, mutation: Mutation) {
        self.inner.log.lock().push(mutation);
    }

    fn emit(&self, table: Table, change: ChangeType, new: Option<Row>, old: Option<Row>) {
        let _ = self.inner.events.send(ChangeEvent {
            table: table.name().to_string(),
            change,
            new,
            old,
        });
    }

    fn insert_row(&self, table: Table, mut row: Row) -> StorageResult<Row> {
        self.check(Operation::Insert, table)?;

        let id = match row.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                row.insert("id".into(), Value::String(id.clone()));
                id
            }
        };

        if table == Table::ParticipantResponses && !row.contains_key("created_at") {
            let now = OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "invalid-timestamp".into());
            row.insert("created_at".into(), Value::String(now));
        }

        let mut tables = self.inner.tables.lock();
        let rows = tables.entry(table).or_default();
        if rows.contains_key(&id) {
            return Err(StorageError::Conflict {
                table: table.name(),
                message: format!("duplicate id `{id}`"),
            });
        }
        if table == Table::Rooms {
            let code = row.get("code");
            if code.is_some() && rows.values().any(|existing| existing.get("code") == code) {
                return Err(StorageError::Conflict {
                    table: table.name(),
                    message: "room code already in use".into(),
                });
            }
        }
        rows.insert(id, row.clone());
        drop(tables);

        self.record(Mutation {
            operation: Operation::Insert,
            table,
            filter: None,
            row: Some(row.clone()),
            affected: 1,
        });
        self.emit(table, ChangeType::Insert, Some(row.clone()), None);
        Ok(row)
    }

    fn update_rows(&self, table: Table, filter: Filter, patch: Row) -> StorageResult<Vec<Row>> {
        self.check(Operation::Update, table)?;

        let mut changes = Vec::new();
        {
            let mut tables = self.inner.tables.lock();
            let rows = tables.entry(table).or_default();
            for row in rows.values_mut().filter(|row| filter.matches(row)) {
                let old = row.clone();
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                changes.push((old, row.clone()));
            }
        }

        self.record(Mutation {
            operation: Operation::Update,
            table,
            filter: Some(filter),
            row: Some(patch),
            affected: changes.len(),
        });

        let mut updated = Vec::with_capacity(changes.len());
        for (old, new) in changes {
            self.emit(table, ChangeType::Update, Some(new.clone()), Some(old));
            updated.push(new);
        }
        Ok(updated)
    }

    fn delete_rows(&self, table: Table, filter: Filter) -> StorageResult<()> {
        self.check(Operation::Delete, table)?;

        if self.inner.ignored_deletes.lock().contains(&table) {
            debug!(%table, "ignoring delete as configured");
            self.record(Mutation {
                operation: Operation::Delete,
                table,
                filter: Some(filter),
                row: None,
                affected: 0,
            });
            return Ok(());
        }

        let removed = {
            let mut tables = self.inner.tables.lock();
            remove_cascading(&mut tables, table, &filter)
        };

        self.record(Mutation {
            operation: Operation::Delete,
            table,
            filter: Some(filter),
            row: None,
            affected: removed.iter().filter(|(t, _)| *t == table).count(),
        });

        for (removed_table, row) in removed {
            self.emit(removed_table, ChangeType::Delete, None, Some(row));
        }
        Ok(())
    }
}

/// Remove the rows of `table` matching `filter` and every dependent row.
fn remove_cascading(
    tables: &mut HashMap<Table, IndexMap<String, Row>>,
    table: Table,
    filter: &Filter,
) -> Vec<(Table, Row)> {
    let rows = tables.entry(table).or_default();
    let doomed: Vec<String> = rows
        .iter()
        .filter(|(_, row)| filter.matches(row))
        .map(|(id, _)| id.clone())
        .collect();

    let mut removed = Vec::new();
    for id in doomed {
        let Some(row) = rows.shift_remove(&id) else {
            continue;
        };
        removed.push((table, row));
    }

    let children: &[(Table, &str)] = match table {
        Table::Rooms => &[
            (Table::Activities, "room_id"),
            (Table::ParticipantResponses, "room_id"),
        ],
        Table::Activities => &[
            (Table::ActivityOptions, "activity_id"),
            (Table::ParticipantResponses, "activity_id"),
        ],
        Table::ActivityOptions | Table::ParticipantResponses => &[],
    };

    let parent_ids: Vec<Value> = removed
        .iter()
        .filter_map(|(_, row)| row.get("id").cloned())
        .collect();
    for (child_table, column) in children {
        for parent_id in &parent_ids {
            let child_filter = Filter::all().eq(*column, parent_id.clone());
            removed.extend(remove_cascading(tables, *child_table, &child_filter));
        }
    }

    removed
}

impl DataStore for MemoryBackend {
    fn query(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let backend = self.clone();
        Box::pin(async move {
            backend.check(Operation::Query, table)?;
            let tables = backend.inner.tables.lock();
            Ok(tables
                .get(&table)
                .map(|rows| {
                    rows.values()
                        .filter(|row| filter.matches(row))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn insert(&self, table: Table, row: Row) -> BoxFuture<'static, StorageResult<Row>> {
        let backend = self.clone();
        Box::pin(async move { backend.insert_row(table, row) })
    }

    fn update(
        &self,
        table: Table,
        filter: Filter,
        patch: Row,
    ) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let backend = self.clone();
        Box::pin(async move { backend.update_rows(table, filter, patch) })
    }

    fn delete(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<()>> {
        let backend = self.clone();
        Box::pin(async move { backend.delete_rows(table, filter) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let backend = self.clone();
        Box::pin(async move {
            if backend.inner.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StorageError::unavailable(
                    "memory backend is offline".into(),
                    io::Error::new(io::ErrorKind::NotConnected, "offline"),
                ))
            }
        })
    }
}

enum Step {
    Deliver(ChangeEvent),
    Skip,
    Stop,
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(
        &self,
        channel: &str,
        specs: Vec<EventSpec>,
    ) -> BoxFuture<'static, StorageResult<FeedSubscription>> {
        let inner = self.inner.clone();
        let channel = channel.to_string();
        Box::pin(async move {
            let refused = inner
                .failing_subscriptions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if refused || !inner.healthy.load(Ordering::SeqCst) {
                return Err(StorageError::unavailable(
                    format!("subscription to `{channel}` refused"),
                    io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                ));
            }

            let (status_tx, status_rx) = watch::channel(FeedStatus::Subscribed);
            if let Some(previous) = inner.channels.insert(channel.clone(), status_tx) {
                let _ = previous.send(FeedStatus::Closed);
            }

            let mut receiver = inner.events.subscribe();
            let mut status = status_rx.clone();
            let events = async_stream::stream! {
                loop {
                    let step = tokio::select! {
                        changed = status.changed() => {
                            if changed.is_err() || *status.borrow() != FeedStatus::Subscribed {
                                Step::Stop
                            } else {
                                Step::Skip
                            }
                        }
                        received = receiver.recv() => match received {
                            Ok(event) if specs.iter().any(|spec| spec.selects(&event)) => Step::Deliver(event),
                            Ok(_) => Step::Skip,
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(channel = %channel, skipped, "subscriber lagged; breaking channel");
                                if let Some(sender) = inner.channels.get(&channel) {
                                    let _ = sender.send(FeedStatus::Error("lagged".into()));
                                }
                                Step::Stop
                            }
                            Err(RecvError::Closed) => Step::Stop,
                        }
                    };

                    match step {
                        Step::Deliver(event) => yield event,
                        Step::Skip => continue,
                        Step::Stop => break,
                    }
                }
            };

            Ok(FeedSubscription {
                status: status_rx,
                events: Box::pin(events),
            })
        })
    }

    fn unsubscribe(&self, channel: &str) {
        if let Some((_, status)) = self.inner.channels.remove(channel) {
            let _ = status.send(FeedStatus::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_emits_events() {
        let backend = MemoryBackend::new();
        let mut subscription = backend
            .subscribe("global", vec![EventSpec::table(Table::Rooms)])
            .await
            .unwrap();

        let inserted = backend
            .insert(Table::Rooms, row(json!({"code": "1234", "name": "Demo"})))
            .await
            .unwrap();
        assert!(inserted.contains_key("id"));

        let event = subscription.events.next().await.unwrap();
        assert_eq!(event.change, ChangeType::Insert);
        assert_eq!(event.new.as_ref(), Some(&inserted));
    }

    #[tokio::test]
    async fn duplicate_room_codes_conflict() {
        let backend = MemoryBackend::new();
        backend
            .insert(Table::Rooms, row(json!({"code": "1234", "name": "A"})))
            .await
            .unwrap();
        let err = backend
            .insert(Table::Rooms, row(json!({"code": "1234", "name": "B"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn deleting_an_activity_cascades_to_options_and_responses() {
        let backend = MemoryBackend::new();
        let activity = backend
            .insert(Table::Activities, row(json!({"room_id": "r", "title": "Q"})))
            .await
            .unwrap();
        let activity_id = activity["id"].clone();
        backend
            .insert(Table::ActivityOptions, row(json!({"activity_id": activity_id, "text": "A"})))
            .await
            .unwrap();
        backend
            .insert(
                Table::ParticipantResponses,
                row(json!({"activity_id": activity_id, "room_id": "r"})),
            )
            .await
            .unwrap();

        backend
            .delete(Table::Activities, Filter::all().eq("id", activity_id))
            .await
            .unwrap();

        assert!(backend.rows(Table::Activities).is_empty());
        assert!(backend.rows(Table::ActivityOptions).is_empty());
        assert!(backend.rows(Table::ParticipantResponses).is_empty());
    }

    #[tokio::test]
    async fn injected_faults_fail_only_the_requested_calls() {
        let backend = MemoryBackend::new();
        backend.fail_next(Operation::Insert, Table::Rooms, 1);

        let first = backend
            .insert(Table::Rooms, row(json!({"code": "1", "name": "A"})))
            .await;
        assert!(matches!(first, Err(StorageError::Unavailable { .. })));

        backend
            .insert(Table::Rooms, row(json!({"code": "1", "name": "A"})))
            .await
            .unwrap();
        assert_eq!(backend.rows(Table::Rooms).len(), 1);
    }

    #[tokio::test]
    async fn ignored_deletes_leave_rows_in_place() {
        let backend = MemoryBackend::new();
        let room = backend
            .insert(Table::Rooms, row(json!({"code": "1", "name": "A"})))
            .await
            .unwrap();
        backend.ignore_deletes(Table::Rooms);
        backend
            .delete(Table::Rooms, Filter::all().eq("id", room["id"].clone()))
            .await
            .unwrap();
        assert_eq!(backend.rows(Table::Rooms).len(), 1);
    }

    #[tokio::test]
    async fn specs_filter_delivered_events() {
        let backend = MemoryBackend::new();
        let mut subscription = backend
            .subscribe(
                "room-r1",
                vec![EventSpec::filtered(
                    Table::Activities,
                    Filter::all().eq("room_id", "r1"),
                )],
            )
            .await
            .unwrap();

        backend
            .insert(Table::Activities, row(json!({"room_id": "r2", "title": "other"})))
            .await
            .unwrap();
        backend
            .insert(Table::Activities, row(json!({"room_id": "r1", "title": "mine"})))
            .await
            .unwrap();

        let event = subscription.events.next().await.unwrap();
        assert_eq!(event.new.unwrap()["title"], json!("mine"));
    }

    #[tokio::test]
    async fn dropped_channel_reports_error_and_ends_stream() {
        let backend = MemoryBackend::new();
        let mut subscription = backend
            .subscribe("global", vec![EventSpec::table(Table::Rooms)])
            .await
            .unwrap();

        backend.drop_channel("global");

        assert!(subscription.events.next().await.is_none());
        assert!(matches!(
            *subscription.status.borrow(),
            FeedStatus::Error(_)
        ));
    }

    #[tokio::test]
    async fn refused_subscriptions_count_down() {
        let backend = MemoryBackend::new();
        backend.fail_subscriptions(1);
        assert!(backend.subscribe("global", Vec::new()).await.is_err());
        assert!(backend.subscribe("global", Vec::new()).await.is_ok());
    }
}
