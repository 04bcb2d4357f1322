//! Poll-based file watching (`watchFile`/`unwatchFile`).
//!
//! Grounded on `rcore-fs/src/dev/mod.rs`'s `TimeProvider`/`StdTimeProvider`
//! split: production code drives real wall-clock time, tests inject a fake
//! one. Here the same shape is generalized from "what time is it" to "run
//! this callback every N milliseconds", since the poll watcher needs a
//! recurring timer rather than a single clock read.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::inode::Stat;

/// Injected timer collaborator. Production code wires this to a real
/// interval timer; tests can fire it manually.
pub trait IntervalScheduler: Send + Sync {
    fn set_interval(&self, callback: Arc<dyn Fn() + Send + Sync>, interval_ms: u64) -> u64;
    fn clear_interval(&self, handle: u64);
}

struct Watch {
    path: String,
    listener: Arc<dyn Fn(Stat, Stat) + Send + Sync>,
    previous: Mutex<Stat>,
}

/// Registry of active `watchFile` timers.
pub struct PollWatcher {
    scheduler: Arc<dyn IntervalScheduler>,
    watches: RwLock<BTreeMap<u64, Watch>>,
}

impl PollWatcher {
    pub fn new(scheduler: Arc<dyn IntervalScheduler>) -> Self {
        PollWatcher {
            scheduler,
            watches: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start polling `path` every `interval_ms`, diffing every `Stat`
    /// field against the previous poll and delivering `(current, previous)`
    /// to `listener` on change. `stat_fn` maps a path to its current stat,
    /// returning `Stat::empty()` for a path that does not exist.
    ///
    /// If the path does not exist at registration time, the initial
    /// `(empty, empty)` pair is delivered synchronously before the first
    /// timer tick.
    pub fn watch_file(
        &self,
        path: &str,
        interval_ms: u64,
        stat_fn: Arc<dyn Fn(&str) -> Stat + Send + Sync>,
        listener: Arc<dyn Fn(Stat, Stat) + Send + Sync>,
    ) -> u64 {
        let initial = stat_fn(path);
        if initial == Stat::empty() {
            listener(Stat::empty(), Stat::empty());
        }

        let previous = Arc::new(Mutex::new(initial));
        let tick_previous = previous.clone();
        let tick_listener = listener.clone();
        let tick_stat_fn = stat_fn.clone();
        let tick_path = path.to_string();

        let handle = self.scheduler.set_interval(
            Arc::new(move || {
                let current = tick_stat_fn(&tick_path);
                let mut prev = tick_previous.lock().unwrap();
                if *prev != current {
                    let old = *prev;
                    *prev = current;
                    tick_listener(current, old);
                }
            }),
            interval_ms,
        );

        self.watches.write().unwrap().insert(
            handle,
            Watch {
                path: path.to_string(),
                listener,
                previous: Mutex::new(*previous.lock().unwrap()),
            },
        );
        handle
    }

    /// Stop every watch on `path`. If `listener` is given, only watches
    /// whose listener is the same `Arc` allocation are removed.
    pub fn unwatch_file(&self, path: &str, listener: Option<&Arc<dyn Fn(Stat, Stat) + Send + Sync>>) {
        let mut watches = self.watches.write().unwrap();
        let to_remove: Vec<u64> = watches
            .iter()
            .filter(|(_, w)| {
                w.path == path
                    && listener
                        .map(|l| Arc::ptr_eq(l, &w.listener))
                        .unwrap_or(true)
            })
            .map(|(h, _)| *h)
            .collect();
        for handle in to_remove {
            watches.remove(&handle);
            self.scheduler.clear_interval(handle);
        }
    }

    pub fn active_count(&self) -> usize {
        self.watches.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ManualScheduler {
        next_handle: AtomicU64,
        callbacks: Mutex<BTreeMap<u64, Arc<dyn Fn() + Send + Sync>>>,
    }

    impl ManualScheduler {
        fn new() -> Self {
            ManualScheduler {
                next_handle: AtomicU64::new(1),
                callbacks: Mutex::new(BTreeMap::new()),
            }
        }

        fn fire_all(&self) {
            let callbacks: Vec<_> = self.callbacks.lock().unwrap().values().cloned().collect();
            for cb in callbacks {
                cb();
            }
        }
    }

    impl IntervalScheduler for ManualScheduler {
        fn set_interval(&self, callback: Arc<dyn Fn() + Send + Sync>, _interval_ms: u64) -> u64 {
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
            self.callbacks.lock().unwrap().insert(handle, callback);
            handle
        }

        fn clear_interval(&self, handle: u64) {
            self.callbacks.lock().unwrap().remove(&handle);
        }
    }

    fn stat_with_size(size: u64) -> Stat {
        let mut s = Stat::empty();
        s.size = size;
        s
    }

    #[test]
    fn delivers_empty_pair_for_missing_path() {
        let scheduler = Arc::new(ManualScheduler::new());
        let watcher = PollWatcher::new(scheduler);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        watcher.watch_file(
            "/missing",
            100,
            Arc::new(|_| Stat::empty()),
            Arc::new(move |cur, prev| seen2.lock().unwrap().push((cur, prev))),
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (Stat::empty(), Stat::empty()));
    }

    #[test]
    fn fires_on_stat_change_and_stops_after_unwatch() {
        let scheduler = Arc::new(ManualScheduler::new());
        let watcher = PollWatcher::new(scheduler.clone());
        let size = Arc::new(std::sync::atomic::AtomicU64::new(1));
        let size2 = size.clone();
        let stat_fn: Arc<dyn Fn(&str) -> Stat + Send + Sync> =
            Arc::new(move |_path| stat_with_size(size2.load(Ordering::SeqCst)));

        let events = Arc::new(Mutex::new(0usize));
        let events2 = events.clone();
        watcher.watch_file("/f", 50, stat_fn, Arc::new(move |_cur, _prev| {
            *events2.lock().unwrap() += 1;
        }));

        scheduler.fire_all();
        assert_eq!(*events.lock().unwrap(), 0);

        size.store(2, Ordering::SeqCst);
        scheduler.fire_all();
        assert_eq!(*events.lock().unwrap(), 1);

        watcher.unwatch_file("/f", None);
        assert_eq!(watcher.active_count(), 0);
        size.store(3, Ordering::SeqCst);
        scheduler.fire_all();
        assert_eq!(*events.lock().unwrap(), 1);
    }
}
