use serde::Serialize;
use uuid::Uuid;

use crate::state::room::{Activity, Room};

/// What the public display should present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum DisplayTarget {
    /// Nothing is live.
    Idle,
    /// Present this activity.
    Activity {
        /// Activity to present.
        activity_id: Uuid,
        /// Chosen through the room pointer while its `is_active` flag says otherwise.
        stale_flag: bool,
    },
}

impl DisplayTarget {
    /// Activity shown, if any.
    pub fn activity_id(&self) -> Option<Uuid> {
        match self {
            DisplayTarget::Idle => None,
            DisplayTarget::Activity { activity_id, .. } => Some(*activity_id),
        }
    }
}

/// Pick the activity to display.
///
/// The room pointer wins even when the activity's flag lags behind, then any
/// activity flagged active, then the idle view.
pub fn resolve<'a>(
    room: Option<&Room>,
    activities: impl IntoIterator<Item = &'a Activity>,
) -> DisplayTarget {
    let activities: Vec<&Activity> = activities.into_iter().collect();

    if let Some(current) = room.and_then(|room| room.current_activity_id)
        && let Some(activity) = activities.iter().find(|activity| activity.id == current)
    {
        return DisplayTarget::Activity {
            activity_id: activity.id,
            stale_flag: !activity.is_active,
        };
    }

    activities
        .iter()
        .find(|activity| activity.is_active)
        .map(|activity| DisplayTarget::Activity {
            activity_id: activity.id,
            stale_flag: false,
        })
        .unwrap_or(DisplayTarget::Idle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::snapshot::tests::{activity, room};

    #[test]
    fn pointer_is_trusted_over_a_stale_flag() {
        let mut current = room(Uuid::new_v4());
        let a1 = activity(current.id, 0);
        let mut a2 = activity(current.id, 1);
        a2.is_active = true;
        current.current_activity_id = Some(a1.id);

        assert_eq!(
            resolve(Some(&current), [&a1, &a2]),
            DisplayTarget::Activity {
                activity_id: a1.id,
                stale_flag: true,
            }
        );
    }

    #[test]
    fn falls_back_to_any_active_activity() {
        let current = room(Uuid::new_v4());
        let a1 = activity(current.id, 0);
        let mut a2 = activity(current.id, 1);
        a2.is_active = true;

        assert_eq!(resolve(Some(&current), [&a1, &a2]).activity_id(), Some(a2.id));
    }

    #[test]
    fn dangling_pointer_and_nothing_active_is_idle() {
        let mut current = room(Uuid::new_v4());
        current.current_activity_id = Some(Uuid::new_v4());
        let a1 = activity(current.id, 0);

        assert_eq!(resolve(Some(&current), [&a1]), DisplayTarget::Idle);
        assert_eq!(resolve(None, Vec::<&Activity>::new()), DisplayTarget::Idle);
    }
}
