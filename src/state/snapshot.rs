//! Reconciled client-side snapshot of rooms and the selected room's activities.
//!
//! Two kinds of writes reach the snapshot. Optimistic edits are applied
//! synchronously by the services before their network round trip starts;
//! change events and full reloads carry authoritative records that overwrite
//! those guesses per entity id. Ids with a delete in flight sit in the
//! pending-deletion map until the delete event arrives or their TTL expires,
//! and nothing may re-insert them meanwhile.

use std::{collections::HashMap, time::Duration};

use indexmap::IndexMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    dao::{
        data_store::{ChangeEvent, ChangeType},
        models::{ActivityEntity, OptionEntity, RoomEntity, decode, row_id},
        storage::Table,
    },
    state::room::{Activity, ActivityOption, Room},
};

/// Local edit applied before the corresponding store write is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticEdit {
    /// Clear `is_active` on every activity of the room.
    DeactivateAllInRoom {
        /// Room whose activities are cleared.
        room_id: Uuid,
    },
    /// Set the active flag of one activity.
    SetActive {
        /// Activity to flag.
        activity_id: Uuid,
        /// New flag value.
        active: bool,
    },
    /// Point the room at an activity (or at nothing).
    SetCurrentActivity {
        /// Room to update.
        room_id: Uuid,
        /// New pointer.
        activity_id: Option<Uuid>,
    },
    /// Drop an activity from the selected room.
    RemoveActivity {
        /// Activity to drop.
        activity_id: Uuid,
    },
    /// Rewrite order indexes following the given sequence.
    Reorder {
        /// Activity ids in their new order.
        ordered_ids: Vec<Uuid>,
    },
    /// Count one more vote on the activity and, for choice kinds, the option.
    IncrementVote {
        /// Activity voted on.
        activity_id: Uuid,
        /// Option chosen, for choice kinds.
        option_id: Option<Uuid>,
    },
    /// Show a just created activity.
    InsertActivity(Activity),
}

/// Result of merging one change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The snapshot changed.
    Applied,
    /// The event matched what the snapshot already held.
    Unchanged,
    /// The event does not concern the snapshot.
    Ignored(&'static str),
    /// An option arrived for an activity the snapshot does not know.
    UnknownParent {
        /// Activity the option points at.
        activity_id: Uuid,
    },
    /// The event could not be merged; only a full reload restores consistency.
    NeedsReload(String),
}

/// In-memory room/activity store.
#[derive(Debug)]
pub struct RoomStore {
    rooms: IndexMap<Uuid, Room>,
    selected: Option<Uuid>,
    activities: IndexMap<Uuid, Activity>,
    pending_deletions: HashMap<Uuid, Instant>,
    pending_ttl: Duration,
    revision: u64,
}

impl RoomStore {
    /// Empty store; deletions stay pending for `pending_ttl`.
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            rooms: IndexMap::new(),
            selected: None,
            activities: IndexMap::new(),
            pending_deletions: HashMap::new(),
            pending_ttl,
            revision: 0,
        }
    }

    /// Monotonic counter bumped on every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Known rooms.
    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    /// Room by id.
    pub fn room(&self, id: Uuid) -> Option<&Room> {
        self.rooms.get(&id)
    }

    /// Id of the selected room.
    pub fn selected_room_id(&self) -> Option<Uuid> {
        self.selected
    }

    /// The selected room.
    pub fn selected_room(&self) -> Option<&Room> {
        self.selected.and_then(|id| self.rooms.get(&id))
    }

    /// Activities of the selected room sorted by order index.
    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }

    /// Activity of the selected room.
    pub fn activity(&self, id: Uuid) -> Option<&Activity> {
        self.activities.get(&id)
    }

    /// Ids of the selected room's activities.
    pub fn activity_ids(&self) -> Vec<Uuid> {
        self.activities.keys().copied().collect()
    }

    /// Whether a delete for `id` is still in flight at `now`.
    pub fn is_pending_deletion(&self, id: Uuid, now: Instant) -> bool {
        self.pending_deletions
            .get(&id)
            .is_some_and(|expiry| *expiry > now)
    }

    /// Replace the room list with an authoritative listing.
    pub fn replace_rooms(&mut self, rooms: Vec<Room>) {
        let next: IndexMap<Uuid, Room> = rooms.into_iter().map(|room| (room.id, room)).collect();
        if next != self.rooms {
            self.rooms = next;
            self.bump();
        }
    }

    /// Make `room` the selected room, discarding the previous room's activities.
    pub fn select(&mut self, room: Room) {
        let id = room.id;
        self.rooms.insert(id, room);
        if self.selected != Some(id) {
            self.activities.clear();
            self.pending_deletions.clear();
        }
        self.selected = Some(id);
        self.bump();
    }

    /// Forget the selected room and everything attached to it.
    pub fn clear_selection(&mut self) {
        if self.selected.is_none() && self.activities.is_empty() {
            return;
        }
        self.selected = None;
        self.activities.clear();
        self.pending_deletions.clear();
        self.bump();
    }

    /// Install a full reload of the selected room, skipping ids with a delete in flight.
    ///
    /// Returns `false` when the room is no longer the selected one.
    pub fn replace_room_snapshot(
        &mut self,
        room: Room,
        activities: Vec<Activity>,
        now: Instant,
    ) -> bool {
        if self.selected != Some(room.id) {
            return false;
        }
        self.expire_pending(now);

        let mut next: IndexMap<Uuid, Activity> = activities
            .into_iter()
            .filter(|activity| !self.pending_deletions.contains_key(&activity.id))
            .map(|mut activity| {
                activity
                    .options
                    .retain(|option| !self.pending_deletions.contains_key(&option.id));
                (activity.id, activity)
            })
            .collect();
        sort_activities(&mut next);

        let room_changed = self.rooms.get(&room.id) != Some(&room);
        let activities_changed = next != self.activities;
        self.rooms.insert(room.id, room);
        self.activities = next;
        if room_changed || activities_changed {
            self.bump();
        }
        true
    }

    /// Record a delete in flight for `id`.
    pub fn mark_pending_deletion(&mut self, id: Uuid, now: Instant) {
        self.pending_deletions.insert(id, now + self.pending_ttl);
    }

    /// Drop the pending entry of `id` without waiting for its delete event.
    pub fn clear_pending_deletion(&mut self, id: Uuid) {
        self.pending_deletions.remove(&id);
    }

    /// Drop pending entries whose TTL elapsed; returns how many were dropped.
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let before = self.pending_deletions.len();
        self.pending_deletions.retain(|_, expiry| *expiry > now);
        before - self.pending_deletions.len()
    }

    /// Apply an optimistic edit; returns whether anything changed.
    pub fn apply_optimistic(&mut self, edit: OptimisticEdit) -> bool {
        let changed = match edit {
            OptimisticEdit::DeactivateAllInRoom { room_id } => {
                let mut changed = false;
                for activity in self
                    .activities
                    .values_mut()
                    .filter(|activity| activity.room_id == room_id && activity.is_active)
                {
                    activity.is_active = false;
                    changed = true;
                }
                changed
            }
            OptimisticEdit::SetActive {
                activity_id,
                active,
            } => match self.activities.get_mut(&activity_id) {
                Some(activity) if activity.is_active != active => {
                    activity.is_active = active;
                    true
                }
                _ => false,
            },
            OptimisticEdit::SetCurrentActivity {
                room_id,
                activity_id,
            } => match self.rooms.get_mut(&room_id) {
                Some(room) if room.current_activity_id != activity_id => {
                    room.current_activity_id = activity_id;
                    true
                }
                _ => false,
            },
            OptimisticEdit::RemoveActivity { activity_id } => {
                self.activities.shift_remove(&activity_id).is_some()
            }
            OptimisticEdit::Reorder { ordered_ids } => {
                let mut changed = false;
                for (index, id) in ordered_ids.iter().enumerate() {
                    let order = index as i32;
                    if let Some(activity) = self.activities.get_mut(id)
                        && activity.order != order
                    {
                        activity.order = order;
                        changed = true;
                    }
                }
                if changed {
                    sort_activities(&mut self.activities);
                }
                changed
            }
            OptimisticEdit::IncrementVote {
                activity_id,
                option_id,
            } => match self.activities.get_mut(&activity_id) {
                Some(activity) => {
                    activity.total_responses = activity.total_responses.saturating_add(1);
                    if let Some(option) = option_id.and_then(|id| {
                        activity.options.iter_mut().find(|option| option.id == id)
                    }) {
                        option.response_count = option.response_count.saturating_add(1);
                    }
                    true
                }
                None => false,
            },
            OptimisticEdit::InsertActivity(activity) => {
                if self.selected != Some(activity.room_id)
                    || self.activities.contains_key(&activity.id)
                {
                    false
                } else {
                    self.activities.insert(activity.id, activity);
                    sort_activities(&mut self.activities);
                    true
                }
            }
        };

        if changed {
            self.bump();
        }
        changed
    }

    /// Merge one change event; idempotent and commutative per entity id.
    pub fn merge(&mut self, event: &ChangeEvent, now: Instant) -> MergeOutcome {
        self.expire_pending(now);

        let Some(table) = Table::from_name(&event.table) else {
            return MergeOutcome::NeedsReload(format!("unknown table `{}`", event.table));
        };

        let outcome = match (table, event.change) {
            (Table::Rooms, ChangeType::Delete) => self.merge_room_delete(event),
            (Table::Rooms, _) => self.merge_room(event),
            (Table::Activities, ChangeType::Delete) => self.merge_activity_delete(event),
            (Table::Activities, _) => self.merge_activity(event, now),
            (Table::ActivityOptions, ChangeType::Delete) => self.merge_option_delete(event),
            (Table::ActivityOptions, _) => self.merge_option(event, now),
            (Table::ParticipantResponses, _) => {
                MergeOutcome::Ignored("responses only move counters through their own rows")
            }
        };

        if outcome == MergeOutcome::Applied {
            self.bump();
        }
        outcome
    }

    fn merge_room(&mut self, event: &ChangeEvent) -> MergeOutcome {
        let room = match decode_new::<RoomEntity>(event) {
            Ok(entity) => Room::from(entity),
            Err(reason) => return MergeOutcome::NeedsReload(reason),
        };
        match self.rooms.get(&room.id) {
            Some(existing) if *existing == room => MergeOutcome::Unchanged,
            _ => {
                self.rooms.insert(room.id, room);
                MergeOutcome::Applied
            }
        }
    }

    fn merge_room_delete(&mut self, event: &ChangeEvent) -> MergeOutcome {
        let Some(id) = event.old.as_ref().and_then(row_id) else {
            return MergeOutcome::NeedsReload("room delete without id".into());
        };
        if self.rooms.shift_remove(&id).is_none() {
            return MergeOutcome::Unchanged;
        }
        if self.selected == Some(id) {
            self.selected = None;
            self.activities.clear();
            self.pending_deletions.clear();
        }
        MergeOutcome::Applied
    }

    fn merge_activity(&mut self, event: &ChangeEvent, now: Instant) -> MergeOutcome {
        let entity = match decode_new::<ActivityEntity>(event) {
            Ok(entity) => entity,
            Err(reason) => return MergeOutcome::NeedsReload(reason),
        };
        if self.selected != Some(entity.room_id) {
            return MergeOutcome::Ignored("activity of another room");
        }
        if self.is_pending_deletion(entity.id, now) {
            return MergeOutcome::Ignored("activity deletion in flight");
        }

        let changed = match self.activities.get_mut(&entity.id) {
            Some(existing) => {
                let mut next = existing.clone();
                next.overwrite(entity);
                if next == *existing {
                    false
                } else {
                    *existing = next;
                    true
                }
            }
            None => {
                self.activities.insert(entity.id, Activity::from(entity));
                true
            }
        };

        if changed {
            sort_activities(&mut self.activities);
            MergeOutcome::Applied
        } else {
            MergeOutcome::Unchanged
        }
    }

    fn merge_activity_delete(&mut self, event: &ChangeEvent) -> MergeOutcome {
        let Some(id) = event.old.as_ref().and_then(row_id) else {
            return MergeOutcome::NeedsReload("activity delete without id".into());
        };
        self.pending_deletions.remove(&id);
        if self.activities.shift_remove(&id).is_some() {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Unchanged
        }
    }

    fn merge_option(&mut self, event: &ChangeEvent, now: Instant) -> MergeOutcome {
        let option = match decode_new::<OptionEntity>(event) {
            Ok(entity) => ActivityOption::from(entity),
            Err(reason) => return MergeOutcome::NeedsReload(reason),
        };
        if self.is_pending_deletion(option.activity_id, now)
            || self.is_pending_deletion(option.id, now)
        {
            return MergeOutcome::Ignored("option deletion in flight");
        }
        match self.activities.get_mut(&option.activity_id) {
            Some(activity) => {
                if activity.upsert_option(option) {
                    MergeOutcome::Applied
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => MergeOutcome::UnknownParent {
                activity_id: option.activity_id,
            },
        }
    }

    fn merge_option_delete(&mut self, event: &ChangeEvent) -> MergeOutcome {
        let Some(id) = event.old.as_ref().and_then(row_id) else {
            return MergeOutcome::NeedsReload("option delete without id".into());
        };
        self.pending_deletions.remove(&id);
        let removed = self
            .activities
            .values_mut()
            .any(|activity| activity.remove_option(id));
        if removed {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Unchanged
        }
    }

    fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

fn decode_new<T: serde::de::DeserializeOwned>(event: &ChangeEvent) -> Result<T, String> {
    let row = event
        .new
        .as_ref()
        .ok_or_else(|| format!("{:?} on `{}` without a row", event.change, event.table))?;
    decode(row).map_err(|err| format!("undecodable `{}` row: {err}", event.table))
}

fn sort_activities(activities: &mut IndexMap<Uuid, Activity>) {
    activities.sort_by(|_, left, _, right| left.order.cmp(&right.order));
}
