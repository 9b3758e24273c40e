//! Wait-handle lookup keyed by tool-use id
//!
//! Each parked tool call owns one capacity-1 slot. Registration is an
//! atomic insert-if-absent; the returned `WaitHandle` removes its own
//! slot on drop, whichever way the wait ends. Notification never
//! blocks: a full slot (already fired) or a missing one is skipped.

use crate::bus::Event;
use crate::error::{HitlError, Result};
use crate::types::Approval;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome delivered to a parked call
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub approved: bool,
    pub message: String,
    pub image_paths: Vec<String>,
    pub updated_input: Option<serde_json::Value>,
}

impl Verdict {
    /// Read a verdict from an `ApprovalResolved` event payload
    pub fn from_event(event: &Event) -> Option<Self> {
        Some(Self {
            approved: event.bool_field("approved")?,
            message: event.str_field("response_text").unwrap_or_default().to_string(),
            image_paths: event.string_list("image_paths"),
            updated_input: event
                .data
                .get("updated_input")
                .filter(|v| !v.is_null())
                .cloned(),
        })
    }

    /// Read a verdict from a stored approval, `None` while pending
    pub fn from_approval(approval: &Approval) -> Option<Self> {
        if approval.is_pending() {
            return None;
        }
        Some(Self {
            approved: approval.status == crate::types::ApprovalStatus::Approved,
            message: approval.comment.clone().unwrap_or_default(),
            image_paths: approval.attachments.clone(),
            updated_input: approval.updated_input.clone(),
        })
    }
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<Verdict>,
}

/// Concurrent map of parked calls
#[derive(Clone, Default)]
pub struct WaitRegistry {
    slots: Arc<DashMap<String, Slot>>,
    next_id: Arc<AtomicU64>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a call on `tool_use_id`
    ///
    /// Fails with `AlreadyWaiting` if another call holds the slot.
    pub fn register(&self, tool_use_id: &str) -> Result<WaitHandle> {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match self.slots.entry(tool_use_id.to_string()) {
            Entry::Occupied(_) => return Err(HitlError::AlreadyWaiting(tool_use_id.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { id, tx });
            }
        }

        tracing::debug!(tool_use_id = %tool_use_id, "Wait handle registered");

        Ok(WaitHandle {
            slots: self.slots.clone(),
            tool_use_id: tool_use_id.to_string(),
            id,
            rx,
        })
    }

    /// Deliver a verdict to whoever waits on `tool_use_id`
    ///
    /// Returns `false` when nobody waits or the slot already fired.
    pub fn notify(&self, tool_use_id: &str, verdict: Verdict) -> bool {
        let Some(slot) = self.slots.get(tool_use_id) else {
            return false;
        };
        match slot.tx.try_send(verdict) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(tool_use_id = %tool_use_id, "Wait handle already fired");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_waiting(&self, tool_use_id: &str) -> bool {
        self.slots.contains_key(tool_use_id)
    }

    /// Number of parked calls
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A parked call's receiving end; deregisters on drop
pub struct WaitHandle {
    slots: Arc<DashMap<String, Slot>>,
    tool_use_id: String,
    id: u64,
    rx: mpsc::Receiver<Verdict>,
}

impl WaitHandle {
    pub async fn recv(&mut self) -> Option<Verdict> {
        self.rx.recv().await
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        let id = self.id;
        if self
            .slots
            .remove_if(&self.tool_use_id, |_, slot| slot.id == id)
            .is_some()
        {
            tracing::debug!(tool_use_id = %self.tool_use_id, "Wait handle deregistered");
        }
    }
}
