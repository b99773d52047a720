use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::environment::JupyterEnvironment;
use crate::error::EnvironmentError;

/// Notification pushed to listeners when the environment transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    /// A run was spawned and is waiting for readiness.
    Starting,
    /// The readiness banner was parsed; port and token are available.
    Ready,
    /// The server process terminated and the run state was cleared.
    Exit,
    /// Fired alongside every `Starting`/`Ready`/`Exit`.
    Change,
    /// The run failed; fired before the corresponding `Exit`/`Change`.
    Error(EnvironmentError),
}

impl EnvironmentEvent {
    pub fn kind(&self) -> EnvironmentEventKind {
        match self {
            EnvironmentEvent::Starting => EnvironmentEventKind::Starting,
            EnvironmentEvent::Ready => EnvironmentEventKind::Ready,
            EnvironmentEvent::Exit => EnvironmentEventKind::Exit,
            EnvironmentEvent::Change => EnvironmentEventKind::Change,
            EnvironmentEvent::Error(_) => EnvironmentEventKind::Error,
        }
    }
}

/// Subscription key; every listener watches exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentEventKind {
    Starting,
    Ready,
    Exit,
    Change,
    Error,
}

/// Handle returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub(crate) type EventListener =
    Arc<dyn Fn(&JupyterEnvironment, &EnvironmentEvent) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    once: bool,
    listener: EventListener,
}

/// Per-instance listener table keyed by event kind.
///
/// Listeners are invoked by the dispatch task with no registry lock held, so
/// they may freely re-subscribe or query the controller.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EnvironmentEventKind, Vec<ListenerEntry>>>,
}

impl ListenerRegistry {
    pub(crate) fn subscribe(
        &self,
        kind: EnvironmentEventKind,
        listener: EventListener,
        once: bool,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners
                .entry(kind)
                .or_default()
                .push(ListenerEntry { id, once, listener });
        }
        SubscriptionId(id)
    }

    /// Removes the listener with the given id. Returns whether one existed.
    pub(crate) fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != subscription.0);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Returns the listeners for one kind in subscription order, dropping
    /// one-shot entries from the table as it goes.
    pub(crate) fn take_for_dispatch(&self, kind: EnvironmentEventKind) -> Vec<EventListener> {
        let Ok(mut listeners) = self.listeners.lock() else {
            return Vec::new();
        };
        let Some(entries) = listeners.get_mut(&kind) else {
            return Vec::new();
        };
        let snapshot = entries
            .iter()
            .map(|entry| Arc::clone(&entry.listener))
            .collect();
        entries.retain(|entry| !entry.once);
        snapshot
    }
}
