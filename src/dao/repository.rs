//! Typed access to the backing store.
//!
//! Services never build raw rows themselves: every read and write goes
//! through here so that "no rows found" consistently becomes `None` and
//! undecodable rows surface as [`StorageError::Malformed`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::dao::{
    data_store::DataStore,
    models::{ActivityEntity, OptionEntity, ResponseEntity, RoomEntity, decode, encode},
    storage::{Filter, Row, StorageError, StorageResult, Table},
};

/// Build a patch row from column/value pairs.
pub fn patch<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs
        .into_iter()
        .map(|(column, value)| (column.to_string(), value))
        .collect()
}

fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Row>) -> StorageResult<Vec<T>> {
    rows.iter()
        .map(|row| decode_row(table, row))
        .collect()
}

fn decode_row<T: DeserializeOwned>(table: Table, row: &Row) -> StorageResult<T> {
    decode(row).map_err(|err| StorageError::Malformed {
        table: table.name(),
        message: err.to_string(),
    })
}

fn encode_row<T: serde::Serialize>(table: Table, entity: &T) -> StorageResult<Row> {
    encode(entity).map_err(|err| StorageError::Malformed {
        table: table.name(),
        message: err.to_string(),
    })
}

/// Repository over the rooms, activities, options and responses tables.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn DataStore>,
}

impl Repository {
    /// Wrap a store.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    async fn select<T: DeserializeOwned>(&self, table: Table, filter: Filter) -> StorageResult<Vec<T>> {
        match self.store.query(table, filter).await {
            Ok(rows) => decode_rows(table, rows),
            Err(err) if err.is_no_rows() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: Table,
        filter: Filter,
    ) -> StorageResult<Option<T>> {
        Ok(self.select(table, filter).await?.into_iter().next())
    }

    async fn insert_entity<T>(&self, table: Table, entity: &T) -> StorageResult<T>
    where
        T: serde::Serialize + DeserializeOwned,
    {
        let row = encode_row(table, entity)?;
        let stored = self.store.insert(table, row).await?;
        decode_row(table, &stored)
    }

    async fn update_where<T: DeserializeOwned>(
        &self,
        table: Table,
        filter: Filter,
        patch: Row,
    ) -> StorageResult<Vec<T>> {
        match self.store.update(table, filter, patch).await {
            Ok(rows) => decode_rows(table, rows),
            Err(err) if err.is_no_rows() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    /// Every room.
    pub async fn list_rooms(&self) -> StorageResult<Vec<RoomEntity>> {
        self.select(Table::Rooms, Filter::all()).await
    }

    /// Room by id.
    pub async fn find_room(&self, id: Uuid) -> StorageResult<Option<RoomEntity>> {
        self.select_one(Table::Rooms, Filter::by_id(id)).await
    }

    /// Room by join code.
    pub async fn find_room_by_code(&self, code: &str) -> StorageResult<Option<RoomEntity>> {
        self.select_one(Table::Rooms, Filter::all().eq("code", code))
            .await
    }

    /// Insert a room and return the stored row.
    pub async fn insert_room(&self, room: &RoomEntity) -> StorageResult<RoomEntity> {
        self.insert_entity(Table::Rooms, room).await
    }

    /// Patch matching rooms; returns the updated rows.
    pub async fn update_rooms(&self, filter: Filter, patch: Row) -> StorageResult<Vec<RoomEntity>> {
        self.update_where(Table::Rooms, filter, patch).await
    }

    // -----------------------------------------------------------------------
    // Activities
    // -----------------------------------------------------------------------

    /// Activities of a room sorted by their order index.
    pub async fn list_activities(&self, room_id: Uuid) -> StorageResult<Vec<ActivityEntity>> {
        let mut activities: Vec<ActivityEntity> = self
            .select(
                Table::Activities,
                Filter::all().eq("room_id", room_id.to_string()),
            )
            .await?;
        activities.sort_by_key(|activity| activity.order);
        Ok(activities)
    }

    /// Activity by id.
    pub async fn find_activity(&self, id: Uuid) -> StorageResult<Option<ActivityEntity>> {
        self.select_one(Table::Activities, Filter::by_id(id)).await
    }

    /// Insert an activity and return the stored row.
    pub async fn insert_activity(&self, activity: &ActivityEntity) -> StorageResult<ActivityEntity> {
        self.insert_entity(Table::Activities, activity).await
    }

    /// Patch matching activities; returns the updated rows.
    pub async fn update_activities(
        &self,
        filter: Filter,
        patch: Row,
    ) -> StorageResult<Vec<ActivityEntity>> {
        self.update_where(Table::Activities, filter, patch).await
    }

    /// Delete an activity; the store cascades its options and responses.
    pub async fn delete_activity(&self, id: Uuid) -> StorageResult<()> {
        self.store.delete(Table::Activities, Filter::by_id(id)).await
    }

    // -----------------------------------------------------------------------
    // Options
    // -----------------------------------------------------------------------

    /// Options of an activity sorted by their order index.
    pub async fn list_options(&self, activity_id: Uuid) -> StorageResult<Vec<OptionEntity>> {
        let mut options: Vec<OptionEntity> = self
            .select(
                Table::ActivityOptions,
                Filter::all().eq("activity_id", activity_id.to_string()),
            )
            .await?;
        options.sort_by_key(|option| option.order);
        Ok(options)
    }

    /// Option by id.
    pub async fn find_option(&self, id: Uuid) -> StorageResult<Option<OptionEntity>> {
        self.select_one(Table::ActivityOptions, Filter::by_id(id))
            .await
    }

    /// Insert an option and return the stored row.
    pub async fn insert_option(&self, option: &OptionEntity) -> StorageResult<OptionEntity> {
        self.insert_entity(Table::ActivityOptions, option).await
    }

    /// Patch matching options; returns the updated rows.
    pub async fn update_options(
        &self,
        filter: Filter,
        patch: Row,
    ) -> StorageResult<Vec<OptionEntity>> {
        self.update_where(Table::ActivityOptions, filter, patch)
            .await
    }

    // -----------------------------------------------------------------------
    // Responses
    // -----------------------------------------------------------------------

    /// A participant's response to an activity.
    pub async fn find_response(
        &self,
        activity_id: Uuid,
        participant_id: Uuid,
    ) -> StorageResult<Option<ResponseEntity>> {
        self.select_one(
            Table::ParticipantResponses,
            Filter::all()
                .eq("activity_id", activity_id.to_string())
                .eq("participant_id", participant_id.to_string()),
        )
        .await
    }

    /// Every response to an activity.
    pub async fn list_responses(&self, activity_id: Uuid) -> StorageResult<Vec<ResponseEntity>> {
        self.select(
            Table::ParticipantResponses,
            Filter::all().eq("activity_id", activity_id.to_string()),
        )
        .await
    }

    /// Insert a response and return the stored row.
    pub async fn insert_response(&self, response: &ResponseEntity) -> StorageResult<ResponseEntity> {
        self.insert_entity(Table::ParticipantResponses, response)
            .await
    }

    /// Delete every response of a room.
    pub async fn delete_room_responses(&self, room_id: Uuid) -> StorageResult<()> {
        self.store
            .delete(
                Table::ParticipantResponses,
                Filter::all().eq("room_id", room_id.to_string()),
            )
            .await
    }

    /// Probe the store.
    pub async fn health_check(&self) -> StorageResult<()> {
        self.store.health_check().await
    }
}
