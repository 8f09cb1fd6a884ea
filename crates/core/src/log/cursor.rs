//! Consumer-group cursors for one session

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::event::EventId;

/// Read position of one consumer group
#[derive(Debug, Clone)]
pub struct ConsumerCursor {
    /// Last acknowledged event id (0 = nothing acknowledged)
    pub acked: EventId,
    attachments: usize,
    detached_at: Option<Instant>,
}

impl ConsumerCursor {
    fn new(acked: EventId) -> Self {
        Self {
            acked,
            attachments: 0,
            detached_at: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attachments > 0
    }

    fn expired(&self, grace: Duration, now: Instant) -> bool {
        match self.detached_at {
            Some(at) if self.attachments == 0 => now.saturating_duration_since(at) >= grace,
            _ => false,
        }
    }
}

/// Cursor table keyed by consumer group name.
///
/// Each group sits in its own map entry, so groups advance independently and a
/// slow group never holds a lock another group needs.
#[derive(Debug, Default)]
pub(crate) struct CursorTable {
    groups: DashMap<String, ConsumerCursor>,
}

impl CursorTable {
    /// Register (or re-attach) a group. An explicit `start` repositions the
    /// cursor; otherwise an existing group resumes where it left off.
    pub(crate) fn attach(&self, group: &str, start: Option<EventId>) -> EventId {
        let mut cursor = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| ConsumerCursor::new(0));
        if let Some(start) = start {
            cursor.acked = start;
        }
        cursor.attachments += 1;
        cursor.detached_at = None;
        cursor.acked
    }

    pub(crate) fn detach(&self, group: &str) {
        if let Some(mut cursor) = self.groups.get_mut(group) {
            cursor.attachments = cursor.attachments.saturating_sub(1);
            if cursor.attachments == 0 {
                cursor.detached_at = Some(Instant::now());
            }
        }
    }

    /// Advance a group's cursor; cursors never move backwards through `ack`.
    pub(crate) fn ack(&self, group: &str, id: EventId) -> Option<EventId> {
        let mut cursor = self.groups.get_mut(group)?;
        if id > cursor.acked {
            cursor.acked = id;
        }
        Some(cursor.acked)
    }

    pub(crate) fn get(&self, group: &str) -> Option<ConsumerCursor> {
        self.groups.get(group).map(|c| c.clone())
    }

    /// Lowest acknowledged id among registered groups.
    pub(crate) fn floor(&self) -> Option<EventId> {
        self.groups.iter().map(|c| c.acked).min()
    }

    /// Drop groups detached for at least `grace`, returning their names.
    pub(crate) fn expire(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.groups.retain(|name, cursor| {
            if cursor.expired(grace, now) {
                expired.push(name.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}
