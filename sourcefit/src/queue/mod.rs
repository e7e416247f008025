//! Bounded producer/consumer queue of object lists.
//!
//! A driver thread submits object lists; worker threads claim them, run the
//! measurement callback, and mark them done. Finished lists leave the queue
//! through the sink strictly in submission order, whatever order the
//! workers finish in.
//!
//! All queue state lives behind one mutex:
//!
//! ```text
//!   flush <= claim <= add,   add - flush <= capacity
//!
//!   [ flush .. claim )  claimed or done, waiting to be flushed in order
//!   [ claim .. add   )  pending, waiting for a worker
//! ```

#[cfg(test)]
mod tests;

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::objlist::ObjectList;

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Pending(ObjectList),
    Claimed,
    Done(ObjectList),
}

#[derive(Debug)]
struct QueueState {
    slots: Vec<Slot>,
    /// Sequence number of the next submitted list.
    add: u64,
    /// Sequence number of the next list to measure.
    claim: u64,
    /// Sequence number of the next list to hand to the sink.
    flush: u64,
    closed: bool,
}

impl QueueState {
    fn slot(&mut self, seq: u64) -> &mut Slot {
        let n = self.slots.len() as u64;
        &mut self.slots[(seq % n) as usize]
    }
}

#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    work_available: Condvar,
    space_freed: Condvar,
}

impl WorkQueue {
    /// Queue holding at most `capacity` lists between submission and flush.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState {
                slots: (0..capacity).map(|_| Slot::Empty).collect(),
                add: 0,
                claim: 0,
                flush: 0,
                closed: false,
            }),
            work_available: Condvar::new(),
            space_freed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Enqueues `list` and returns its sequence number. Blocks while the
    /// queue is full; fails once the queue is shut down.
    pub fn submit(&self, list: ObjectList) -> Result<u64> {
        let mut state = self.state.lock();
        let capacity = state.slots.len() as u64;
        while !state.closed && state.add - state.flush >= capacity {
            self.space_freed.wait(&mut state);
        }
        if state.closed {
            return Err(Error::QueueClosed);
        }
        let seq = state.add;
        *state.slot(seq) = Slot::Pending(list);
        state.add += 1;
        self.work_available.notify_one();
        Ok(seq)
    }

    /// Stops accepting lists. Workers drain what was already submitted,
    /// flush it and return.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        info!(submitted = state.add, flushed = state.flush, "Work queue shutting down");
        drop(state);
        self.work_available.notify_all();
        self.space_freed.notify_all();
    }

    /// Runs `workers` measurement threads until the queue is shut down and
    /// drained. Every submitted list goes through `measure` once and then
    /// to `sink` with its sequence number, in submission order.
    ///
    /// # Panics
    /// A panic in `measure` closes the queue, so blocked submitters get
    /// [`Error::QueueClosed`], and is re-raised once the remaining workers
    /// have drained.
    pub fn run_workers<M, S>(&self, workers: usize, measure: M, sink: S)
    where
        M: Fn(&mut ObjectList) + Sync,
        S: FnMut(u64, ObjectList) + Send,
    {
        assert!(workers > 0, "at least one worker is required");
        let sink = Mutex::new(sink);
        let (measure, sink) = (&measure, &sink);
        thread::scope(|scope| {
            for id in 0..workers {
                scope.spawn(move || self.worker(id, measure, sink));
            }
        });
    }

    fn worker<M, S>(&self, id: usize, measure: &M, sink: &Mutex<S>)
    where
        M: Fn(&mut ObjectList),
        S: FnMut(u64, ObjectList),
    {
        debug!(worker = id, "Worker started");
        let mut measured = 0usize;
        let mut state = self.state.lock();
        loop {
            self.flush_ready(&mut state, sink);

            if state.claim < state.add {
                let seq = state.claim;
                state.claim += 1;
                let Slot::Pending(mut list) = std::mem::replace(state.slot(seq), Slot::Claimed) else {
                    unreachable!("slot {seq} between claim and add is not pending");
                };
                let outcome = MutexGuard::unlocked(&mut state, || {
                    panic::catch_unwind(AssertUnwindSafe(|| measure(&mut list)))
                });
                *state.slot(seq) = Slot::Done(list);
                if let Err(payload) = outcome {
                    state.closed = true;
                    warn!(worker = id, seq, "Measurement panicked, closing work queue");
                    drop(state);
                    self.work_available.notify_all();
                    self.space_freed.notify_all();
                    panic::resume_unwind(payload);
                }
                measured += 1;
                continue;
            }
            if state.closed {
                break;
            }
            self.work_available.wait(&mut state);
        }
        self.flush_ready(&mut state, sink);
        debug!(worker = id, measured, "Worker finished");
    }

    /// Hands every done list at the flush cursor to the sink, in order.
    fn flush_ready<S>(&self, state: &mut QueueState, sink: &Mutex<S>)
    where
        S: FnMut(u64, ObjectList),
    {
        let mut flushed = false;
        while state.flush < state.claim && matches!(state.slot(state.flush), Slot::Done(_)) {
            let seq = state.flush;
            let Slot::Done(list) = std::mem::take(state.slot(seq)) else {
                break;
            };
            state.flush += 1;
            let mut sink = sink.lock();
            (*sink)(seq, list);
            flushed = true;
        }
        if flushed {
            self.space_freed.notify_all();
        }
    }
}
