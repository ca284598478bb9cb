use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use shared::domain::ChannelId;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::events::{ClientEvent, EventKind};

/// Receives engine events on the dispatcher task. Callbacks must not block.
pub trait ClientObserver: Send + Sync {
    /// Lets an observer skip kinds it does not handle.
    fn accepts(&self, kind: EventKind) -> bool {
        let _ = kind;
        true
    }

    fn on_event(&self, event: &ClientEvent);
}

/// Token returned by observer registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

struct Registration {
    handle: ObserverHandle,
    channel_id: Option<ChannelId>,
    observer: Weak<dyn ClientObserver>,
}

struct ObserverRegistry {
    registrations: Mutex<Vec<Registration>>,
    next_handle: AtomicU64,
    broadcast_tx: broadcast::Sender<ClientEvent>,
}

impl ObserverRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_registered(&self, handle: ObserverHandle) -> bool {
        self.lock().iter().any(|r| r.handle == handle)
    }

    fn remove(&self, handle: ObserverHandle) -> bool {
        let mut registrations = self.lock();
        let before = registrations.len();
        registrations.retain(|r| r.handle != handle);
        registrations.len() != before
    }

    fn deliver(&self, event: &ClientEvent) {
        let kind = event.kind();
        let targets: Vec<(ObserverHandle, Weak<dyn ClientObserver>)> = self
            .lock()
            .iter()
            .filter(|r| match &r.channel_id {
                Some(channel_id) => event.channel_id() == Some(channel_id),
                None => true,
            })
            .map(|r| (r.handle, r.observer.clone()))
            .collect();

        // The lock is released here so callbacks may register or unregister.
        for (handle, observer) in targets {
            if !self.is_registered(handle) {
                continue;
            }
            let Some(observer) = observer.upgrade() else {
                debug!(?handle, "dispatch: pruning dropped observer");
                self.remove(handle);
                continue;
            };
            if !observer.accepts(kind) {
                continue;
            }
            // A panicking observer is dropped; the delivery task keeps running.
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
                warn!(?handle, ?kind, "dispatch: observer panicked and was unregistered");
                self.remove(handle);
            }
        }

        let _ = self.broadcast_tx.send(event.clone());
    }
}

/// Serializes derived events onto one delivery task so every observer sees
/// the same global order.
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    queue: mpsc::UnboundedSender<ClientEvent>,
    observers: Arc<ObserverRegistry>,
}

impl EventDispatcher {
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(buffer: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(buffer.max(1));
        let observers = Arc::new(ObserverRegistry {
            registrations: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            broadcast_tx,
        });
        let (queue, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
        let delivery = Arc::clone(&observers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                delivery.deliver(&event);
            }
            debug!("dispatch: event queue closed");
        });
        Self { queue, observers }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.queue.send(event);
    }

    pub(crate) fn add_observer(
        &self,
        observer: Weak<dyn ClientObserver>,
        channel_id: Option<ChannelId>,
    ) -> ObserverHandle {
        let handle = ObserverHandle(self.observers.next_handle.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push(Registration {
            handle,
            channel_id,
            observer,
        });
        handle
    }

    pub(crate) fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.observers.remove(handle)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.observers.broadcast_tx.subscribe()
    }
}
