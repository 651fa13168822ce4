//! Hashed-wheel timer service.
//!
//! Delays are quantized to the wheel tick and hashed into a fixed ring of
//! slots; an entry carries the number of remaining wheel revolutions. The
//! wheel advances on a dedicated thread, so callbacks fire off-loop and must
//! not block; connection idle checks only read atomics and queue work onto
//! the owning loop.

use crate::atomic;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WHEEL_SLOTS: usize = 512;

type TimerCallback = Box<dyn FnOnce() + Send>;

struct Entry {
    rounds: u64,
    callback: TimerCallback,
}

struct Wheel {
    slots: Vec<Vec<Entry>>,
    pos: usize,
}

struct Inner {
    tick: Duration,
    wheel: Mutex<Wheel>,
    running: atomic::Bool,
}

/// Hashed-wheel timer service running on its own thread.
#[derive(Clone)]
pub struct TimingWheel {
    inner: Arc<Inner>,
}

impl TimingWheel {
    /// Starts the wheel with the given tick duration.
    pub fn start(tick: Duration) -> Self {
        let inner = Arc::new(Inner {
            tick: tick.max(Duration::from_millis(1)),
            wheel: Mutex::new(Wheel {
                slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
                pos: 0,
            }),
            running: atomic::Bool::new(true),
        });
        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name("netloop-timer".to_string())
            .spawn(move || {
                while worker.running.get() {
                    thread::sleep(worker.tick);
                    run_due(&worker);
                }
            })
            .expect("Failed to spawn timer thread");
        Self { inner }
    }

    /// Schedules `callback` to run once, no earlier than `delay` from now.
    pub fn after<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let tick_ms = self.inner.tick.as_millis();
        let ticks = (delay.as_millis().div_ceil(tick_ms)).max(1) as usize;
        let mut wheel = self.inner.wheel.lock().expect("Timer wheel lock poisoned");
        let slot = (wheel.pos + ticks) % WHEEL_SLOTS;
        let rounds = ((ticks - 1) / WHEEL_SLOTS) as u64;
        wheel.slots[slot].push(Entry {
            rounds,
            callback: Box::new(callback),
        });
    }

    /// Stops the wheel thread. Pending callbacks are dropped.
    pub fn stop(&self) {
        self.inner.running.set(false);
    }
}

fn run_due(inner: &Inner) {
    // Callbacks run outside the lock so they may re-arm themselves.
    let due: Vec<TimerCallback> = {
        let mut wheel = inner.wheel.lock().expect("Timer wheel lock poisoned");
        wheel.pos = (wheel.pos + 1) % WHEEL_SLOTS;
        let pos = wheel.pos;
        let mut due = Vec::new();
        let mut keep = Vec::new();
        for mut entry in wheel.slots[pos].drain(..) {
            if entry.rounds == 0 {
                due.push(entry.callback);
            } else {
                entry.rounds -= 1;
                keep.push(entry);
            }
        }
        wheel.slots[pos] = keep;
        due
    };
    for callback in due {
        callback();
    }
}
