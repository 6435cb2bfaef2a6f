//! Bounded, first-come-first-served admission for GPU work.
//!
//! At most `max_concurrent` [`AdmissionSlot`]s exist at once. Everybody else
//! waits in a FIFO queue holding a [`SlotTicket`]. When a slot is released and
//! somebody is waiting, the slot passes directly to the head of the queue, so
//! the active count never dips and a newcomer can never jump ahead.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::{sync::oneshot, time::Instant};

use crate::{jobs::JobId, prelude::*};

/// Shared queue state.
struct Inner {
    max_concurrent: usize,
    state: Mutex<State>,
}

struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
}

/// A queued job.
struct Waiter {
    job_id: JobId,
    enqueued_at: Instant,
    tx: oneshot::Sender<AdmissionSlot>,
}

impl Inner {
    /// Give up a slot held by `from`. Hands it to the first waiter who is
    /// still listening, or frees it.
    fn release_slot(self: &Arc<Self>, from: JobId) {
        let mut state = self.state.lock().expect("lock poisoned");
        while let Some(waiter) = state.waiters.pop_front() {
            let slot = AdmissionSlot {
                job_id: waiter.job_id,
                queue: Some(self.clone()),
            };
            match waiter.tx.send(slot) {
                Ok(()) => {
                    debug!(
                        from = %from,
                        to = %waiter.job_id,
                        waited = ?waiter.enqueued_at.elapsed(),
                        active = state.active,
                        "Handed GPU slot to next job in queue"
                    );
                    return;
                }
                Err(mut slot) => {
                    // The waiter is gone. Disarm the slot, or dropping it would
                    // try to take the lock we already hold.
                    slot.queue = None;
                    trace!(job_id = %waiter.job_id, "Skipping abandoned waiter");
                }
            }
        }
        debug_assert!(state.active > 0, "released more slots than were granted");
        state.active = state.active.saturating_sub(1);
        debug!(job_id = %from, active = state.active, "Released GPU slot");
    }
}

/// Bounds how many GPU jobs run at once.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<Inner>,
}

/// The outcome of [`AdmissionQueue::try_acquire`].
pub enum Admission {
    /// A slot was free.
    Granted(AdmissionSlot),
    /// All slots are busy. `position` counts from 0 at the head of the queue.
    Queued { position: usize, ticket: SlotTicket },
}

impl AdmissionQueue {
    /// Allow `max_concurrent` slots. Zero is treated as one.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(State {
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Take a slot if one is free, or join the back of the queue.
    pub fn try_acquire(&self, job_id: JobId) -> Admission {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        if state.active < self.inner.max_concurrent && state.waiters.is_empty() {
            state.active += 1;
            debug!(%job_id, active = state.active, "Granted GPU slot");
            return Admission::Granted(AdmissionSlot {
                job_id,
                queue: Some(self.inner.clone()),
            });
        }

        let (tx, rx) = oneshot::channel();
        let position = state.waiters.len();
        state.waiters.push_back(Waiter {
            job_id,
            enqueued_at: Instant::now(),
            tx,
        });
        debug!(%job_id, position, "Queued for GPU slot");
        Admission::Queued {
            position,
            ticket: SlotTicket {
                job_id,
                rx,
                queue: self.inner.clone(),
            },
        }
    }

    /// Give a slot back. Equivalent to dropping it.
    pub fn release(&self, slot: AdmissionSlot) {
        drop(slot);
    }

    /// If `job_id` is still queued and `deadline` has passed, remove it from
    /// the queue. Its ticket will then never receive a slot.
    pub fn cancel_if_waiting_too_long(&self, job_id: JobId, deadline: Instant) -> bool {
        if Instant::now() < deadline {
            return false;
        }
        let mut state = self.inner.state.lock().expect("lock poisoned");
        let Some(idx) = state.waiters.iter().position(|w| w.job_id == job_id) else {
            return false;
        };
        if let Some(waiter) = state.waiters.remove(idx) {
            info!(
                %job_id,
                waited = ?waiter.enqueued_at.elapsed(),
                "Evicted job which waited too long for a GPU slot"
            );
        }
        true
    }

    /// Where is `job_id` in the queue, if it's queued?
    pub fn position_of(&self, job_id: JobId) -> Option<usize> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state.waiters.iter().position(|w| w.job_id == job_id)
    }

    /// How many slots are held right now?
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().expect("lock poisoned").active
    }

    /// How many jobs are waiting?
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().expect("lock poisoned").waiters.len()
    }

    /// The most slots that can be held at once.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }
}

/// The right to run one GPU job. Released when dropped.
#[must_use = "dropping a slot releases it immediately"]
pub struct AdmissionSlot {
    job_id: JobId,
    /// `None` once disarmed.
    queue: Option<Arc<Inner>>,
}

impl AdmissionSlot {
    /// The job holding this slot.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.release_slot(self.job_id);
        }
    }
}

/// A place in the queue. Dropping it leaves the queue.
pub struct SlotTicket {
    job_id: JobId,
    rx: oneshot::Receiver<AdmissionSlot>,
    queue: Arc<Inner>,
}

impl SlotTicket {
    /// Wait for a slot. Returns `None` if we were evicted from the queue.
    ///
    /// Do not call again after it has returned.
    pub async fn wait(&mut self) -> Option<AdmissionSlot> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock().expect("lock poisoned");
        state.waiters.retain(|w| w.job_id != self.job_id);
        // If a slot was already sent to us, it is released when `rx` drops,
        // after this lock is gone.
    }
}
