/// In-process store and push feed.
pub mod memory;
/// Store over a PostgREST endpoint.
#[cfg(feature = "rest-store")]
pub mod postgrest;

use futures::{future::BoxFuture, stream::BoxStream};
use serde::Serialize;
use tokio::sync::watch;

use crate::dao::storage::{Filter, Row, StorageResult, Table};

/// Abstraction over the backing store: plain query/mutate calls on raw rows.
pub trait DataStore: Send + Sync {
    /// Rows of `table` matching `filter`.
    fn query(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<Vec<Row>>>;
    /// Insert `row` and return it as stored.
    fn insert(&self, table: Table, row: Row) -> BoxFuture<'static, StorageResult<Row>>;
    /// Returns the rows that were updated; an empty result means the write matched nothing.
    fn update(
        &self,
        table: Table,
        filter: Filter,
        patch: Row,
    ) -> BoxFuture<'static, StorageResult<Vec<Row>>>;
    /// Delete the rows matching `filter`.
    fn delete(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<()>>;
    /// Cheap reachability probe.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Row level mutation kind carried by change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed.
    Delete,
}

/// Row level notification pushed by the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Raw table name; may name a table this client does not know.
    pub table: String,
    /// Kind of row mutation.
    pub change: ChangeType,
    /// Row after the change (insert and update).
    pub new: Option<Row>,
    /// Row before the change (delete, sometimes only the primary key).
    pub old: Option<Row>,
}

impl ChangeEvent {
    /// Row carrying the event payload: `new` when present, `old` otherwise.
    pub fn record(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// Selects which table events a channel receives.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSpec {
    /// Table to receive events from.
    pub table: Table,
    /// Rows of interest; an empty filter selects every row.
    pub filter: Filter,
}

impl EventSpec {
    /// Every event on `table`.
    pub fn table(table: Table) -> Self {
        Self {
            table,
            filter: Filter::all(),
        }
    }

    /// Events on `table` whose row matches `filter`.
    pub fn filtered(table: Table, filter: Filter) -> Self {
        Self { table, filter }
    }

    /// Whether the subscription selects the event.
    pub fn selects(&self, event: &ChangeEvent) -> bool {
        event.table == self.table.name()
            && event
                .record()
                .map(|row| self.filter.matches(row))
                .unwrap_or(false)
    }
}

/// Feed side status of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// Join in progress.
    Subscribing,
    /// Events are flowing.
    Subscribed,
    /// The subscription broke.
    Error(String),
    /// The feed closed the subscription.
    Closed,
}

/// Live subscription handed out by [`ChangeFeed::subscribe`].
pub struct FeedSubscription {
    /// Status reported by the feed.
    pub status: watch::Receiver<FeedStatus>,
    /// Events selected for the channel.
    pub events: BoxStream<'static, ChangeEvent>,
}

/// Push feed of row level mutations, multiplexed over named channels.
pub trait ChangeFeed: Send + Sync {
    /// Resolves once the channel is subscribed, or with the subscription error.
    fn subscribe(
        &self,
        channel: &str,
        specs: Vec<EventSpec>,
    ) -> BoxFuture<'static, StorageResult<FeedSubscription>>;
    /// Close the channel. Unknown channels are ignored.
    fn unsubscribe(&self, channel: &str);
    /// Whether the backend pushes events at all.
    fn is_live(&self) -> bool {
        true
    }
}

/// Feed used by backends without push support: every subscription fails.
pub struct NoFeed;

impl ChangeFeed for NoFeed {
    fn subscribe(
        &self,
        channel: &str,
        _specs: Vec<EventSpec>,
    ) -> BoxFuture<'static, StorageResult<FeedSubscription>> {
        let channel = channel.to_string();
        Box::pin(async move {
            Err(crate::dao::storage::StorageError::Rejected {
                table: "realtime",
                operation: "subscribe",
                message: format!("backend has no change feed (channel `{channel}`)"),
            })
        })
    }

    fn unsubscribe(&self, _channel: &str) {}

    fn is_live(&self) -> bool {
        false
    }
}
