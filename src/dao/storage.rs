use std::{error::Error, fmt};

use serde_json::{Map, Value};
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A raw record as exchanged with the backing store.
pub type Row = Map<String, Value>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The targeted row does not exist. Lookups turn this into `None`.
    #[error("no rows found in `{table}`")]
    NoRows {
        /// Table queried.
        table: &'static str,
    },
    /// The store refused the write because it collides with an existing row.
    #[error("conflicting write on `{table}`: {message}")]
    Conflict {
        /// Table written to.
        table: &'static str,
        /// Store message.
        message: String,
    },
    /// A row came back in a shape this client cannot decode.
    #[error("malformed row in `{table}`: {message}")]
    Malformed {
        /// Table read from.
        table: &'static str,
        /// Decoder message.
        message: String,
    },
    /// The store understood the request but refused it.
    #[error("`{table}` rejected {operation}: {message}")]
    Rejected {
        /// Table targeted.
        table: &'static str,
        /// Operation refused.
        operation: &'static str,
        /// Store message.
        message: String,
    },
    /// Network failure, timeout, or backend outage. Safe to retry.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What failed.
        message: String,
        /// Underlying transport error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether the error only reports an absent row.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, StorageError::NoRows { .. })
    }
}

/// Tables exposed by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Voting sessions.
    Rooms,
    /// Questions belonging to a room.
    Activities,
    /// Answer choices of an activity.
    ActivityOptions,
    /// Individual votes.
    ParticipantResponses,
}

impl Table {
    /// Every table, in cascade order (parents first).
    pub const ALL: [Table; 4] = [
        Table::Rooms,
        Table::Activities,
        Table::ActivityOptions,
        Table::ParticipantResponses,
    ];

    /// Name of the table on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Table::Rooms => "rooms",
            Table::Activities => "activities",
            Table::ActivityOptions => "activity_options",
            Table::ParticipantResponses => "participant_responses",
        }
    }

    /// Parse a wire table name, returning `None` for unknown tables.
    pub fn from_name(name: &str) -> Option<Self> {
        Table::ALL.into_iter().find(|table| table.name() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Conjunction of column equality conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// Filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a `column = value` condition. A `null` value matches absent or null columns.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    /// Filter on the `id` column.
    pub fn by_id(id: impl fmt::Display) -> Self {
        Self::all().eq("id", id.to_string())
    }

    /// Conditions in insertion order.
    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    /// Evaluate the filter against a row.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|(column, expected)| {
            match (row.get(column), expected) {
                (None, Value::Null) => true,
                (Some(actual), expected) => actual == expected,
                (None, _) => false,
            }
        })
    }
}
