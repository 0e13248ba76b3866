//! Room roster: who is in the room, in join order.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::peer::types::ParticipantId;
use crate::signaling::Member;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: ParticipantId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

/// Ordered-by-join mapping from participant id to display name.
///
/// Only roster events from the relay mutate it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomRoster {
    entries: Vec<RosterEntry>,
}

impl RoomRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster. Members already present keep their join time.
    pub fn replace_with_snapshot(&mut self, members: Vec<Member>) {
        let now = Utc::now();
        let mut next = Vec::with_capacity(members.len());
        for m in members {
            if next.iter().any(|e: &RosterEntry| e.id == m.id) {
                continue;
            }
            let joined_at = self
                .entries
                .iter()
                .find(|e| e.id == m.id)
                .map_or(now, |e| e.joined_at);
            next.push(RosterEntry {
                id: m.id,
                display_name: m.display_name,
                joined_at,
            });
        }
        self.entries = next;
    }

    /// Returns `false` if the participant was already present; the name is
    /// updated in that case.
    pub fn join(&mut self, id: ParticipantId, display_name: String) -> bool {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.display_name = display_name;
            return false;
        }
        self.entries.push(RosterEntry {
            id,
            display_name,
            joined_at: Utc::now(),
        });
        true
    }

    pub fn leave(&mut self, id: &ParticipantId) -> Option<RosterEntry> {
        let idx = self.entries.iter().position(|e| &e.id == id)?;
        Some(self.entries.remove(idx))
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn display_name(&self, id: &ParticipantId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.display_name.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn members(&self) -> Vec<Member> {
        self.entries
            .iter()
            .map(|e| Member {
                id: e.id.clone(),
                display_name: e.display_name.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
