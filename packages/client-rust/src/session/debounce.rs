//! Keyed, coalescing debouncer.
//!
//! Scheduling a key that is already pending aborts the earlier task (timer
//! or in-flight work) and starts over. The number of pending keys is
//! published on a `watch` channel so callers can wait for quiescence.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Slot {
    epoch: u64,
    handle: JoinHandle<()>,
}

pub(crate) struct Debouncer {
    slots: Mutex<HashMap<String, Slot>>,
    next_epoch: AtomicU64,
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl Debouncer {
    pub(crate) fn new(cancel: CancellationToken) -> Arc<Self> {
        let (pending, _) = watch::channel(0);
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
            pending,
            cancel,
        })
    }

    /// Runs `task` after `delay` of quiet on `key`. Nothing is scheduled once
    /// the cancellation token fired.
    pub(crate) fn schedule<F>(self: &Arc<Self>, key: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let owned_key = key.to_string();
        // The slot is inserted before this lock is released, so `finish`
        // always finds it.
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = async {
                    tokio::time::sleep(delay).await;
                    task.await;
                } => {}
            }
            this.finish(&owned_key, epoch);
        });
        if let Some(previous) = slots.insert(key.to_string(), Slot { epoch, handle }) {
            previous.handle.abort();
        }
        self.pending.send_replace(slots.len());
    }

    fn finish(&self, key: &str, epoch: u64) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| slot.epoch == epoch) {
            slots.remove(key);
        }
        self.pending.send_replace(slots.len());
    }

    /// Drops the pending task for `key`, if any.
    pub(crate) fn cancel(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.remove(key) {
            slot.handle.abort();
        }
        self.pending.send_replace(slots.len());
    }

    pub(crate) fn cancel_all(&self) {
        let mut slots = self.slots.lock();
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
        self.pending.send_replace(0);
    }

    pub(crate) fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Waits until no key is pending. Returns `false` on timeout.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut idle = self.pending.subscribe();
        let idle_reached = matches!(
            tokio::time::timeout(timeout, idle.wait_for(|pending| *pending == 0)).await,
            Ok(Ok(_))
        );
        idle_reached
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rapid_schedules_coalesce_to_last() {
        let debouncer = Debouncer::new(CancellationToken::new());
        let runs = Arc::new(Mutex::new(Vec::new()));
        for value in ["a", "b", "c"] {
            let runs = Arc::clone(&runs);
            debouncer.schedule("k", Duration::from_millis(300), async move {
                runs.lock().push(value);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(debouncer.pending(), 1);
        assert!(debouncer.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(*runs.lock(), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let debouncer = Debouncer::new(CancellationToken::new());
        let count = Arc::new(AtomicUsize::new(0));
        for key in ["x", "y"] {
            let count = Arc::clone(&count);
            debouncer.schedule(key, Duration::from_millis(50), async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(debouncer.pending(), 2);
        assert!(debouncer.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_everything() {
        let token = CancellationToken::new();
        let debouncer = Debouncer::new(token.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        debouncer.schedule("k", Duration::from_millis(50), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        debouncer.cancel_all();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending(), 0);

        let counter = Arc::clone(&count);
        debouncer.schedule("k", Duration::from_millis(50), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_times_out_while_work_is_pending() {
        let debouncer = Debouncer::new(CancellationToken::new());
        debouncer.schedule("slow", Duration::from_secs(10), async {});
        assert!(!debouncer.wait_idle(Duration::from_secs(1)).await);
        debouncer.cancel("slow");
        assert!(debouncer.wait_idle(Duration::from_millis(1)).await);
    }
}
