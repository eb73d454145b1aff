//! One-shot timers run on a dedicated thread
//!
//! Used for the Data-Out, NOP-In, NOP-In response, Time2Retain and async
//! logout timers. Callbacks run on the timer thread without any timer lock
//! held, so they may schedule or cancel other timers. Callbacks capture weak
//! handles to whatever they act on.

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

pub struct TimerService {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("iscsi-timer".into())
            .spawn(move || run(worker))
            .ok();
        if handle.is_none() {
            log::error!("failed to spawn timer thread, timers will not fire");
        }
        TimerService {
            shared,
            thread: Mutex::new(handle),
        }
    }

    /// Run `f` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse((Instant::now() + delay, id)));
        state.callbacks.insert(id, Box::new(f));
        drop(state);
        self.shared.cond.notify_all();
        trace!("timer {} armed for {:?}", id, delay);
        TimerId(id)
    }

    /// Cancel a pending timer; returns false if it already fired
    pub fn cancel(&self, id: TimerId) -> bool {
        self.shared.state.lock().callbacks.remove(&id.0).is_some()
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.callbacks.clear();
        }
        self.shared.cond.notify_all();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
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
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            debug!("timer thread exiting");
            return;
        }
        let next = state.heap.peek().map(|Reverse((at, id))| (*at, *id));
        match next {
            None => {
                shared.cond.wait(&mut state);
            }
            Some((at, id)) => {
                let now = Instant::now();
                if at > now {
                    shared.cond.wait_for(&mut state, at - now);
                    continue;
                }
                state.heap.pop();
                if let Some(callback) = state.callbacks.remove(&id) {
                    drop(state);
                    callback();
                    state = shared.state.lock();
                }
            }
        }
    }
}
