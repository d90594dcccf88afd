//! Debounced change notifications.
//!
//! Writes to a record family put that family into a pending state and
//! (re)start its debounce window; a burst of writes therefore produces exactly
//! one notification, dispatched one window after the last write. Dispatch runs
//! on a dedicated worker thread, synchronously, in registration order. A
//! panicking listener is reported and does not stop the remaining listeners.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

/// Record families that can be observed for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Log,
    Access,
    Forward,
}

const FAMILIES: usize = 3;

impl Family {
    fn index(self) -> usize {
        match self {
            Family::Log => 0,
            Family::Access => 1,
            Family::Forward => 2,
        }
    }
}

/// Handle returned by [`ChangeNotifier::subscribe`]; pass it back to
/// [`ChangeNotifier::unsubscribe`] for deterministic deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    family: Family,
    id: u64,
}

type Listener = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: [Vec<(u64, Listener)>; FAMILIES],
}

enum Msg {
    Touch(Family),
    Shutdown,
}

/// Coalescing publish/subscribe registry with one debounce window per family.
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
    tx: Sender<Msg>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier").finish_non_exhaustive()
    }
}

impl ChangeNotifier {
    pub fn new(debounce: Duration) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker_registry = Arc::clone(&registry);
        let worker = std::thread::Builder::new()
            .name("appwall-notifier".into())
            .spawn(move || run_worker(&rx, &worker_registry, debounce))
            .expect("spawn notifier worker");
        Self {
            registry,
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a listener for one record family. Registration during a
    /// dispatch affects the next cycle only.
    pub fn subscribe<F>(&self, family: Family, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners[family.index()].push((id, Arc::new(listener)));
        ListenerHandle { family, id }
    }

    pub fn unsubscribe(&self, handle: ListenerHandle) {
        let mut registry = self.registry.lock();
        registry.listeners[handle.family.index()].retain(|(id, _)| *id != handle.id);
    }

    /// Mark a family changed, starting or extending its debounce window.
    pub fn notify(&self, family: Family) {
        // Send failure means the worker is gone; nothing left to notify.
        let _ = self.tx.send(Msg::Touch(family));
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(rx: &Receiver<Msg>, registry: &Mutex<Registry>, debounce: Duration) {
    let mut deadlines: [Option<Instant>; FAMILIES] = [None; FAMILIES];

    loop {
        let nearest = deadlines.iter().flatten().min().copied();
        let msg = match nearest {
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            },
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        };

        match msg {
            Some(Msg::Touch(family)) => {
                // Any write while pending restarts the window.
                deadlines[family.index()] = Some(Instant::now() + debounce);
            }
            Some(Msg::Shutdown) => return,
            None => {}
        }

        let now = Instant::now();
        for (index, slot) in deadlines.iter_mut().enumerate() {
            if slot.is_some_and(|deadline| deadline <= now) {
                *slot = None;
                dispatch(registry, index);
            }
        }
    }
}

fn dispatch(registry: &Mutex<Registry>, index: usize) {
    // Snapshot under the lock; dispatch outside it so listeners may
    // re-register or touch the store without deadlocking.
    let listeners: Vec<Listener> = registry.lock().listeners[index]
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect();

    debug!(family = index, count = listeners.len(), "dispatching change");
    for listener in listeners {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener())) {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(family = index, reason = %reason, "listener failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WINDOW: Duration = Duration::from_millis(50);

    fn counted(notifier: &ChangeNotifier, family: Family) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&count);
        notifier.subscribe(family, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn burst_coalesces_to_one_notification() {
        let notifier = ChangeNotifier::new(WINDOW);
        let count = counted(&notifier, Family::Log);

        for _ in 0..10 {
            notifier.notify(Family::Log);
        }
        std::thread::sleep(WINDOW * 4);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spaced_writes_notify_each_time() {
        let notifier = ChangeNotifier::new(WINDOW);
        let count = counted(&notifier, Family::Access);

        notifier.notify(Family::Access);
        std::thread::sleep(WINDOW * 4);
        notifier.notify(Family::Access);
        std::thread::sleep(WINDOW * 4);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn families_are_independent() {
        let notifier = ChangeNotifier::new(WINDOW);
        let log = counted(&notifier, Family::Log);
        let forward = counted(&notifier, Family::Forward);

        notifier.notify(Family::Log);
        std::thread::sleep(WINDOW * 4);
        assert_eq!(log.load(Ordering::SeqCst), 1);
        assert_eq!(forward.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let notifier = ChangeNotifier::new(WINDOW);
        notifier.subscribe(Family::Log, || panic!("boom"));
        let count = counted(&notifier, Family::Log);

        notifier.notify(Family::Log);
        std::thread::sleep(WINDOW * 4);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let notifier = ChangeNotifier::new(WINDOW);
        let count = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&count);
        let handle = notifier.subscribe(Family::Forward, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.unsubscribe(handle);
        notifier.notify(Family::Forward);
        std::thread::sleep(WINDOW * 4);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
