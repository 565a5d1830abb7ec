//! Shared periodic timer service
//!
//! One scheduler thread drives every lightweight periodic task in the
//! engine: the cadence registry's heartbeat and the supervised path's frame
//! delivery tick. Tasks are owned closures registered under a name; the
//! returned [`TaskHandle`] is the only way to cancel or retune a task, and
//! cancels on drop so a task's lifetime is tied to its owning component.
//!
//! Missed ticks are skipped, never bursted: a task that falls behind runs
//! once and is rescheduled a full interval ahead.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Callback = Arc<Mutex<Box<dyn FnMut() + Send>>>;

struct Task {
    name: String,
    interval: Duration,
    next_due: Instant,
    callback: Callback,
}

struct State {
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// Handle to a registered task. Cancels the task when dropped.
pub struct TaskHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl TaskHandle {
    /// Unregister the task. Safe to call more than once.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if let Some(task) = state.tasks.remove(&self.id) {
                tracing::debug!(task = %task.name, "timer task canceled");
            }
            shared.cv.notify_one();
        }
    }

    /// Change the task's period; the next run is a full new interval away.
    pub fn set_interval(&self, interval: Duration) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if let Some(task) = state.tasks.get_mut(&self.id) {
                task.interval = interval;
                task.next_due = Instant::now() + interval;
            }
            shared.cv.notify_one();
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The scheduler service. Construct once, share by `Arc`.
pub struct TimerService {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("timer-service".into())
            .spawn(move || run_worker(worker_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a periodic task; first run is one interval from now.
    pub fn register(
        &self,
        name: &str,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TaskHandle {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(
            id,
            Task {
                name: name.to_string(),
                interval,
                next_due: Instant::now() + interval,
                callback: Arc::new(Mutex::new(Box::new(callback))),
            },
        );
        drop(state);
        self.shared.cv.notify_one();
        tracing::debug!(task = name, ?interval, "timer task registered");

        TaskHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.cv.notify_one();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let mut state = shared.state.lock();
        if state.shutdown {
            break;
        }

        let now = Instant::now();
        let mut due: Option<u64> = None;
        let mut earliest: Option<Instant> = None;
        for (id, task) in state.tasks.iter() {
            if task.next_due <= now {
                due = Some(*id);
                break;
            }
            if earliest.map_or(true, |e| task.next_due < e) {
                earliest = Some(task.next_due);
            }
        }

        match due {
            Some(id) => {
                let callback = state.tasks.get_mut(&id).map(|task| {
                    // Reschedule first; skip missed ticks instead of bursting
                    task.next_due += task.interval;
                    if task.next_due <= now {
                        task.next_due = now + task.interval;
                    }
                    task.callback.clone()
                });
                drop(state);
                if let Some(callback) = callback {
                    (callback.lock())();
                }
            }
            None => match earliest {
                Some(deadline) => {
                    shared.cv.wait_until(&mut state, deadline);
                }
                None => {
                    shared.cv.wait(&mut state);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_task_fires_periodically() {
        let timer = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _handle = timer.register("counter", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 4, "expected several ticks, got {fired}");
        assert!(fired <= 12, "tick bursting: {fired}");
    }

    #[test]
    fn test_cancel_stops_the_task() {
        let timer = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = timer.register("counter", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(30));
        handle.cancel();
        let at_cancel = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        // At most one in-flight tick after cancel
        assert!(count.load(Ordering::SeqCst) <= at_cancel + 1);
    }

    #[test]
    fn test_handle_drop_cancels() {
        let timer = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        {
            let _handle = timer.register("counter", Duration::from_millis(5), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(20));
        }
        let at_drop = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert!(count.load(Ordering::SeqCst) <= at_drop + 1);
    }

    #[test]
    fn test_set_interval_retunes() {
        let timer = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = timer.register("counter", Duration::from_millis(500), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        handle.set_interval(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(80));
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_independent_tasks() {
        let timer = TimerService::new();
        let fast = Arc::new(AtomicUsize::new(0));
        let slow = Arc::new(AtomicUsize::new(0));
        let f = fast.clone();
        let s = slow.clone();
        let _h1 = timer.register("fast", Duration::from_millis(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let _h2 = timer.register("slow", Duration::from_millis(40), move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(fast.load(Ordering::SeqCst) > slow.load(Ordering::SeqCst));
        assert!(slow.load(Ordering::SeqCst) >= 1);
    }
}
