use std::{fs, io, io::ErrorKind, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Local participant identity and the "already voted" ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    /// Identifier generated once per client installation.
    pub participant_id: Uuid,
    /// Activity id → room id of every vote this client cast.
    #[serde(default)]
    voted: IndexMap<Uuid, Uuid>,
}

impl ParticipantProfile {
    /// Fresh profile with a random participant id and an empty ledger.
    pub fn generate() -> Self {
        Self {
            participant_id: Uuid::new_v4(),
            voted: IndexMap::new(),
        }
    }

    /// Read the profile from `path`, generating a new one when it is missing or unreadable.
    pub fn load_or_generate(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(profile) => {
                    info!(
                        path = %path.display(),
                        participant_id = %profile.participant_id,
                        votes = profile.voted.len(),
                        "loaded participant profile"
                    );
                    profile
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse participant profile; generating a new one"
                    );
                    Self::generate()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no participant profile yet; generating one");
                Self::generate()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read participant profile; generating a new one"
                );
                Self::generate()
            }
        }
    }

    /// Write the profile as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, contents)
    }

    /// Whether a vote for `activity_id` is recorded.
    pub fn has_voted(&self, activity_id: Uuid) -> bool {
        self.voted.contains_key(&activity_id)
    }

    /// Remember a vote; returns `false` when it was already known.
    pub fn record_vote(&mut self, activity_id: Uuid, room_id: Uuid) -> bool {
        self.voted.insert(activity_id, room_id).is_none()
    }

    /// Drop the vote for `activity_id`; returns whether one was recorded.
    pub fn forget_vote(&mut self, activity_id: Uuid) -> bool {
        self.voted.shift_remove(&activity_id).is_some()
    }

    /// Drop every entry of `room_id`; used when the room's responses are reset.
    pub fn clear_room(&mut self, room_id: Uuid) -> usize {
        let before = self.voted.len();
        self.voted.retain(|_, room| *room != room_id);
        before - self.voted.len()
    }

    /// Drop entries of `room_id` whose activity is not in `present`.
    pub fn prune(&mut self, room_id: Uuid, present: &[Uuid]) -> usize {
        let before = self.voted.len();
        self.voted
            .retain(|activity, room| *room != room_id || present.contains(activity));
        before - self.voted.len()
    }

    /// Number of recorded votes.
    pub fn votes(&self) -> usize {
        self.voted.len()
    }
}
