//! State shared between the session handle, its driver and the
//! notification dispatcher.
//!
//! Only the driver of the current epoch writes session state. Every write
//! names the epoch it belongs to and is ignored once `reset` has moved on,
//! so a driver that is still winding down cannot leak into the next run.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use tablelink_protocol::{GameId, PeerId, Role};
use tokio::sync::mpsc;
use tracing::info;

use crate::notify::Listeners;
use crate::participants::ParticipantSet;
use crate::{Notification, SessionStatus};

pub(crate) type NotifySender = mpsc::UnboundedSender<(u64, Notification)>;

#[derive(Default)]
pub(crate) struct State {
    pub(crate) epoch: u64,
    pub(crate) status: SessionStatus,
    pub(crate) participants: ParticipantSet,
    pub(crate) local: Option<(PeerId, Role)>,
    /// Games the rendezvous reported gone. Survives `disconnect()`.
    pub(crate) expired: HashSet<GameId>,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    /// Held by the dispatcher while it runs the listeners of one
    /// notification. Never taken while `state` is held.
    delivery: Mutex<()>,
    pub(crate) listeners: Listeners,
    notify: NotifySender,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    pub(crate) fn new(notify: NotifySender) -> Self {
        Self {
            state: Mutex::new(State::default()),
            delivery: Mutex::new(()),
            listeners: Listeners::default(),
            notify,
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&lock(&self.state))
    }

    pub(crate) fn epoch(&self) -> u64 {
        lock(&self.state).epoch
    }

    pub(crate) fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    /// Mutates state on behalf of the driver of `epoch`. Returns `None`
    /// if that run is over.
    pub(crate) fn update<R>(&self, epoch: u64, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        let mut state = lock(&self.state);
        if state.epoch != epoch {
            return None;
        }
        Some(f(&mut state))
    }

    /// Moves to `status` and notifies if it changed.
    pub(crate) fn set_status(&self, epoch: u64, status: SessionStatus) -> bool {
        self.transition(epoch, status, false)
    }

    /// Moves to `status` and notifies even if it is already current.
    pub(crate) fn reenter_status(&self, epoch: u64, status: SessionStatus) -> bool {
        self.transition(epoch, status, true)
    }

    fn transition(&self, epoch: u64, status: SessionStatus, always: bool) -> bool {
        let mut state = lock(&self.state);
        if state.epoch != epoch || state.status.is_terminal() {
            return false;
        }
        if state.status == status && !always {
            return false;
        }
        info!(from = %state.status, to = %status, "session status");
        state.status = status;
        // Queued under the state lock so the queue order matches the order
        // of transitions.
        let _ = self.notify.send((epoch, Notification::Status(status)));
        true
    }

    /// Queues a notification raised by the driver of `epoch`.
    pub(crate) fn notify(&self, epoch: u64, notification: Notification) {
        let state = lock(&self.state);
        if state.epoch == epoch {
            let _ = self.notify.send((epoch, notification));
        }
    }

    /// Closes the current epoch and returns to a fresh `Ready` state.
    /// `NeedsUpdate` is kept: a newer build is still required.
    ///
    /// A delivery already running stops before its next listener; use
    /// [`wait_for_delivery`](Self::wait_for_delivery) to wait for it.
    pub(crate) fn reset(&self) -> u64 {
        let mut state = lock(&self.state);
        state.epoch += 1;
        state.participants.clear();
        state.local = None;
        if state.status != SessionStatus::Ready && !state.status.is_terminal() {
            state.status = SessionStatus::Ready;
            let _ = self
                .notify
                .send((state.epoch, Notification::Status(SessionStatus::Ready)));
        }
        state.epoch
    }

    /// Runs listeners for a notification of `epoch`, unless that epoch is
    /// closed. The epoch is checked again before each listener. Returns
    /// whether delivery started.
    pub(crate) fn deliver(&self, epoch: u64, notification: &Notification) -> bool {
        let _delivery = lock(&self.delivery);
        if self.epoch() != epoch {
            return false;
        }
        self.listeners
            .deliver(notification, || self.epoch() == epoch);
        true
    }

    /// Blocks until no listener of an earlier delivery is running.
    ///
    /// Callers must not hold any session lock: listeners may call back
    /// into the session.
    pub(crate) fn wait_for_delivery(&self) {
        drop(lock(&self.delivery));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::NotificationKind;

    fn shared() -> (Shared, mpsc::UnboundedReceiver<(u64, Notification)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Shared::new(tx), rx)
    }

    #[test]
    fn test_set_status_unchanged_does_not_notify() {
        let (shared, mut rx) = shared();

        assert!(shared.set_status(0, SessionStatus::Connecting));
        assert!(!shared.set_status(0, SessionStatus::Connecting));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reenter_status_notifies_every_time() {
        let (shared, mut rx) = shared();

        shared.reenter_status(0, SessionStatus::Auth);
        shared.reenter_status(0, SessionStatus::Auth);

        assert_eq!(rx.try_recv().unwrap().1, Notification::Status(SessionStatus::Auth));
        assert_eq!(rx.try_recv().unwrap().1, Notification::Status(SessionStatus::Auth));
    }

    #[test]
    fn test_set_status_from_closed_epoch_is_ignored() {
        let (shared, _rx) = shared();
        shared.set_status(0, SessionStatus::Connecting);

        let epoch = shared.reset();

        assert_eq!(epoch, 1);
        assert!(!shared.set_status(0, SessionStatus::Joined));
        assert_eq!(shared.status(), SessionStatus::Ready);
    }

    #[test]
    fn test_needs_update_is_never_left() {
        let (shared, _rx) = shared();
        shared.set_status(0, SessionStatus::NeedsUpdate);

        assert!(!shared.set_status(0, SessionStatus::Connecting));
        shared.reset();

        assert_eq!(shared.status(), SessionStatus::NeedsUpdate);
    }

    #[test]
    fn test_deliver_drops_closed_epoch() {
        let (shared, _rx) = shared();
        shared.reset();

        assert!(!shared.deliver(0, &Notification::Status(SessionStatus::Joined)));
        assert!(shared.deliver(1, &Notification::Status(SessionStatus::Joined)));
    }

    #[test]
    fn test_deliver_stops_between_listeners_once_reset() {
        let (shared, _rx) = shared();
        let shared = Arc::new(shared);
        let later_calls = Arc::new(AtomicU64::new(0));

        let weak = Arc::downgrade(&shared);
        shared.listeners.add(
            NotificationKind::Status,
            Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.reset();
                }
            }),
        );
        let c = Arc::clone(&later_calls);
        shared.listeners.add(
            NotificationKind::Status,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(shared.deliver(0, &Notification::Status(SessionStatus::Connecting)));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_keeps_expired_games() {
        let (shared, _rx) = shared();
        shared.update(0, |s| s.expired.insert(GameId::from("old")));

        shared.reset();

        assert!(shared.read(|s| s.expired.contains(&GameId::from("old"))));
    }
}
