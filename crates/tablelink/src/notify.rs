//! Listener registry and the task that delivers notifications.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;
use tracing::trace;

use crate::shared::Shared;
use crate::{Notification, NotificationKind};

/// Identifies one registration made with [`Session::on`](crate::Session::on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

type Callback = Box<dyn Fn(&Notification) + Send + Sync>;

struct Listener {
    kind: NotificationKind,
    /// Cleared by `off`; checked right before every invocation, so a
    /// listener removed mid-dispatch is not called again.
    active: AtomicBool,
    /// Held across the `active` check and the call. `off` from another
    /// thread takes it, so it returns only once no call is in flight.
    gate: Mutex<()>,
    callback: Callback,
}

#[derive(Default)]
pub(crate) struct Listeners {
    next: AtomicU64,
    entries: Mutex<Vec<(SubscriptionToken, Arc<Listener>)>>,
    /// The thread running callbacks, while a delivery is in progress.
    dispatching: Mutex<Option<ThreadId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Listeners {
    fn entries(&self) -> MutexGuard<'_, Vec<(SubscriptionToken, Arc<Listener>)>> {
        lock(&self.entries)
    }

    fn on_dispatch_thread(&self) -> bool {
        *lock(&self.dispatching) == Some(thread::current().id())
    }

    pub(crate) fn add(&self, kind: NotificationKind, callback: Callback) -> SubscriptionToken {
        let token = SubscriptionToken(self.next.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            kind,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            callback,
        });
        self.entries().push((token, listener));
        token
    }

    /// Once this returns, the listener is not called again.
    pub(crate) fn remove(&self, token: SubscriptionToken) -> bool {
        let listener = {
            let mut entries = self.entries();
            match entries.iter().position(|(t, _)| *t == token) {
                Some(index) => entries.remove(index).1,
                None => return false,
            }
        };
        if self.on_dispatch_thread() {
            // Called from a callback: the only call in flight is our caller.
            listener.active.store(false, Ordering::SeqCst);
        } else {
            let _gate = lock(&listener.gate);
            listener.active.store(false, Ordering::SeqCst);
        }
        true
    }

    /// Calls every active listener for the notification's kind, in
    /// registration order, while `still_current` holds. Callbacks run
    /// without the registry lock held, so they may register or remove
    /// listeners themselves.
    pub(crate) fn deliver(&self, notification: &Notification, still_current: impl Fn() -> bool) {
        let kind = notification.kind();
        let targets: Vec<Arc<Listener>> = self
            .entries()
            .iter()
            .filter(|(_, l)| l.kind == kind)
            .map(|(_, l)| Arc::clone(l))
            .collect();

        *lock(&self.dispatching) = Some(thread::current().id());
        for listener in targets {
            if !still_current() {
                break;
            }
            let _gate = lock(&listener.gate);
            if listener.active.load(Ordering::SeqCst) {
                (listener.callback)(notification);
            }
        }
        *lock(&self.dispatching) = None;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Delivers queued notifications one at a time, in queue order.
///
/// Each notification carries the epoch it was raised in; anything from an
/// epoch that `disconnect()` has since closed is dropped.
pub(crate) async fn dispatch(shared: Arc<Shared>, mut queue: mpsc::UnboundedReceiver<(u64, Notification)>) {
    while let Some((epoch, notification)) = queue.recv().await {
        if !shared.deliver(epoch, &notification) {
            trace!(epoch, ?notification, "dropping notification from a closed run");
        }
    }
}
