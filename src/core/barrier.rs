use super::sync::{Ordering, AtomicU32, AtomicPtr, Mutex, Condvar};
use super::job::JobId;
use super::scheduler::SchedulerId;
use super::Shared;
use crate::handle::{JobHandle, PreparedJob};
use crate::{Error, Result};

use std::fmt;
use std::sync::{Arc, Weak};

// For debugging.
// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_BARRIER_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);

const STATE_OPEN: u32 = 0;
const STATE_RELEASED: u32 = 1;
// One of the predecessors was discarded, the barrier will never be released.
const STATE_ABANDONED: u32 = 2;

/// A fan-in synchronization point.
///
/// A barrier is created with the number of arrivals it expects. Jobs built with
/// `JobBuilder::signal` deliver one arrival when they complete, and arrivals can also be
/// delivered manually with `Barrier::signal`.
///
/// Jobs registered via `add_pending` are submitted to the scheduler exactly once, by
/// whichever thread delivers the last arrival.
///
/// Barriers are cheap to clone, clones refer to the same barrier.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<BarrierInner>,
}

struct BarrierInner {
    // The number of arrivals we are still waiting for.
    remaining: AtomicU32,
    count: u32,
    // Number of jobs configured to signal this barrier, to catch wiring mistakes early.
    attached: AtomicU32,
    state: AtomicU32,
    // The jobs to submit once all arrivals are in.
    pending: AtomicLinkedList<JobId>,
    // To block in `wait`.
    mutex: Mutex<()>,
    cond: Condvar,
    // Barriers are stored in job slots, so a strong reference would be a cycle.
    shared: Weak<Shared>,
    scheduler: SchedulerId,
    id: u32,
}

impl Barrier {
    pub(crate) fn new(count: u32, shared: Weak<Shared>, scheduler: SchedulerId) -> Self {
        let state = if count == 0 { STATE_RELEASED } else { STATE_OPEN };

        Barrier {
            inner: Arc::new(BarrierInner {
                remaining: AtomicU32::new(count),
                count,
                attached: AtomicU32::new(0),
                state: AtomicU32::new(state),
                pending: AtomicLinkedList::new(),
                mutex: Mutex::new(()),
                cond: Condvar::new(),
                shared,
                scheduler,
                id: NEXT_BARRIER_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// An ID for debugging.
    pub fn id(&self) -> u32 { self.inner.id }

    /// The number of arrivals this barrier was created with.
    pub fn count(&self) -> u32 { self.inner.count }

    /// The number of arrivals that haven't been delivered yet.
    pub fn remaining(&self) -> u32 {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Whether the pending jobs have been submitted.
    pub fn is_released(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_RELEASED
    }

    /// Whether one of the predecessors was discarded, in which case the pending jobs were
    /// discarded as well.
    pub fn is_abandoned(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_ABANDONED
    }

    /// Register a job to submit once all arrivals are in.
    ///
    /// This is meant to be called while building the dependency graph, before the
    /// predecessors can complete. If the barrier is already released, the job is
    /// submitted right away.
    pub fn add_pending(&self, job: PreparedJob) -> JobHandle {
        let handle = job.disarm();
        assert_eq!(
            handle.scheduler_id(), self.inner.scheduler,
            "barrier {} and job {:?} belong to different schedulers", self.inner.id, handle.id(),
        );

        self.inner.pending.push(handle.id());

        // This can be called concurrently with the last arrival: the releasing thread may
        // have emptied the list before our push. To prevent the job from sitting in the
        // list forever we check the state a second time and take care of it ourselves.
        let shared = &*handle.shared;
        if self.inner.state.load(Ordering::SeqCst) == STATE_ABANDONED {
            self.inner.pending.pop_all(&mut |job| shared.discard(job));
        } else if self.inner.remaining.load(Ordering::SeqCst) == 0 {
            self.inner.pending.pop_all(&mut |job| shared.push_ready(job));
        }

        handle
    }

    /// Deliver one arrival from outside of a job, for example from a completion callback
    /// of an external system.
    ///
    /// If this is the last arrival the pending jobs are submitted on the calling thread.
    ///
    /// Panics if the barrier already received all of its arrivals.
    pub fn signal(&self) {
        match self.arrive() {
            Some(true) => {}
            Some(false) => return,
            None => panic!(
                "barrier {} signaled more than {} times",
                self.inner.id, self.inner.count,
            ),
        }

        match self.inner.shared.upgrade() {
            Some(shared) => self.release(&shared),
            // The scheduler is gone, nothing could run anyway.
            None => self.inner.set_state(STATE_RELEASED),
        }
    }

    /// Block until the barrier is released.
    ///
    /// Returns an error if the barrier was abandoned because one of its predecessors was
    /// discarded.
    pub fn wait(&self) -> Result<()> {
        profiling::scope!("barrier::wait");
        let mut guard = self.inner.mutex.lock().unwrap();
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                STATE_RELEASED => return Ok(()),
                STATE_ABANDONED => return Err(Error::Abandoned(self.inner.id)),
                _ => {}
            }

            guard = self.inner.cond.wait(guard).unwrap();
        }
    }

    pub(crate) fn scheduler_id(&self) -> SchedulerId { self.inner.scheduler }

    /// Account for a job that will signal this barrier when it completes.
    pub(crate) fn attach(&self) {
        let attached = self.inner.attached.fetch_add(1, Ordering::Relaxed);
        assert!(
            attached < self.inner.count,
            "barrier {} expects {} arrivals but more jobs signal it",
            self.inner.id, self.inner.count,
        );
    }

    /// Decrement the arrival counter, returns true for the last arrival.
    ///
    /// The read-modify-write makes the "am I the last one" decision atomic, and AcqRel
    /// makes the work of every predecessor visible to the thread that releases.
    ///
    /// Returns `None` without touching the counter if all arrivals are already in.
    pub(crate) fn arrive(&self) -> Option<bool> {
        let previous = self.inner.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| remaining.checked_sub(1))
            .ok()?;

        Some(previous == 1)
    }

    /// Submit the pending jobs. Must only be called by the thread that delivered the last
    /// arrival.
    pub(crate) fn release(&self, shared: &Shared) {
        profiling::scope!("barrier::release");

        let mut released = 0;
        self.inner.pending.pop_all(&mut |job| {
            shared.push_ready(job);
            released += 1;
        });

        tracing::trace!(barrier = self.inner.id, released, "barrier released");

        self.inner.set_state(STATE_RELEASED);
    }

    /// Discard the pending jobs of a barrier that can't be released anymore.
    pub(crate) fn abandon(&self, shared: &Shared) {
        let res = self.inner.state.compare_exchange(
            STATE_OPEN,
            STATE_ABANDONED,
            Ordering::SeqCst,
            Ordering::Relaxed,
        );
        if res.is_err() {
            return;
        }

        let mut discarded = 0;
        self.inner.pending.pop_all(&mut |job| {
            shared.discard(job);
            discarded += 1;
        });

        tracing::debug!(barrier = self.inner.id, discarded, "barrier abandoned");

        self.inner.notify_waiters();
    }
}

impl BarrierInner {
    fn set_state(&self, state: u32) {
        let _ = self.state.compare_exchange(STATE_OPEN, state, Ordering::SeqCst, Ordering::Relaxed);
        self.notify_waiters();
    }

    fn notify_waiters(&self) {
        std::mem::drop(self.mutex.lock().unwrap());
        self.cond.notify_all();
    }
}

impl Drop for BarrierInner {
    fn drop(&mut self) {
        // Nobody can release the barrier anymore. Jobs still waiting on it would block
        // their waiters forever, so discard them.
        let shared = self.shared.upgrade();
        let mut discarded = 0;
        self.pending.pop_all(&mut |job| {
            if let Some(shared) = &shared {
                shared.discard(job);
            }
            discarded += 1;
        });

        if discarded > 0 {
            tracing::debug!(barrier = self.id, discarded, "barrier dropped before its release");
        }
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("id", &self.inner.id)
            .field("count", &self.inner.count)
            .field("remaining", &self.remaining())
            .field("released", &self.is_released())
            .finish()
    }
}

/// A lock-free stack where items are pushed one by one and popped all at once.
pub(crate) struct AtomicLinkedList<T> {
    first: AtomicPtr<Node<T>>,
}

struct Node<T> {
    payload: T,
    next: *mut Node<T>,
}

unsafe impl<T: Send> Send for AtomicLinkedList<T> {}
unsafe impl<T: Send> Sync for AtomicLinkedList<T> {}

impl<T> AtomicLinkedList<T> {
    pub fn new() -> Self {
        AtomicLinkedList {
            first: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn push(&self, payload: T) {
        let node = Box::into_raw(Box::new(Node {
            payload,
            next: std::ptr::null_mut(),
        }));

        let mut first = self.first.load(Ordering::Acquire);
        loop {
            unsafe {
                (*node).next = first;
            }

            let res = self.first
                .compare_exchange_weak(first, node, Ordering::SeqCst, Ordering::Acquire);
            match res {
                Ok(_) => break,
                Err(actual) => first = actual,
            }
        }
    }

    pub fn pop_all(&self, cb: &mut dyn FnMut(T)) {
        // First atomically swap out the first node.
        let mut node = self.first.swap(std::ptr::null_mut(), Ordering::SeqCst);

        // Now that we have exclusive access to the nodes, we can execute the callback.
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            cb(boxed.payload);
        }
    }
}

impl<T> Drop for AtomicLinkedList<T> {
    fn drop(&mut self) {
        self.pop_all(&mut |_| {});
    }
}

#[test]
fn test_barrier_releases_once() {
    use crate::{Scheduler, JobFlags};
    use std::sync::atomic::{AtomicBool, AtomicU32};

    let scheduler = Scheduler::builder().with_worker_threads(4).build().unwrap();

    for _ in 0..500 {
        let finished = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicU32::new(0));
        let early = Arc::new(AtomicBool::new(false));

        let barrier = scheduler.barrier(8);

        let mut successors = Vec::new();
        for _ in 0..3 {
            let finished = finished.clone();
            let released = released.clone();
            let early = early.clone();
            successors.push(scheduler.job(move |_| {
                if finished.load(Ordering::SeqCst) != 8 {
                    early.store(true, Ordering::SeqCst);
                }
                released.fetch_add(1, Ordering::SeqCst);
            }).after(&barrier).unwrap());
        }

        for _ in 0..8 {
            let finished = finished.clone();
            scheduler.job(move |_| { finished.fetch_add(1, Ordering::SeqCst); })
                .signal(&barrier)
                .with_flags(JobFlags::NONE)
                .submit()
                .unwrap();
        }

        barrier.wait().unwrap();
        for successor in &successors {
            successor.wait().unwrap();
        }

        assert!(!early.load(Ordering::SeqCst));
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(barrier.remaining(), 0);
    }

    scheduler.shutdown().wait();
}

#[test]
fn test_external_signals() {
    use crate::Scheduler;
    use std::sync::atomic::AtomicU32;

    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    for _ in 0..100 {
        let barrier = scheduler.barrier(16);
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let successor = scheduler.job(move |_| { r.fetch_add(1, Ordering::SeqCst); })
            .after(&barrier)
            .unwrap();

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| barrier.signal());
            }
        });

        successor.wait().unwrap();
        assert!(barrier.is_released());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    scheduler.shutdown().wait();
}

#[test]
fn test_add_pending_after_release() {
    use crate::Scheduler;

    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    // No arrivals to wait for.
    let barrier = scheduler.barrier(0);
    assert!(barrier.is_released());
    let handle = barrier.add_pending(scheduler.job(|_| {}).prepare().unwrap());
    handle.wait().unwrap();

    let barrier = scheduler.barrier(1);
    barrier.signal();
    barrier.wait().unwrap();
    let handle = scheduler.job(|_| {}).after(&barrier).unwrap();
    handle.wait().unwrap();

    scheduler.shutdown().wait();
}

#[test]
fn test_abandoned_barrier() {
    use crate::Scheduler;

    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    let barrier = scheduler.barrier(2);
    let successor = scheduler.job(|_| { panic!("must not run"); }).after(&barrier).unwrap();

    let first = scheduler.job(|_| {}).signal(&barrier).submit().unwrap();
    // Never submitted: the barrier can't be released anymore.
    let second = scheduler.job(|_| {}).signal(&barrier).prepare().unwrap();
    let second_handle = second.handle();
    std::mem::drop(second);

    first.wait().unwrap();
    assert!(matches!(second_handle.wait(), Err(Error::Discarded(_))));
    assert!(matches!(successor.wait(), Err(Error::Discarded(_))));
    assert!(matches!(barrier.wait(), Err(Error::Abandoned(_))));
    assert!(barrier.is_abandoned());

    scheduler.shutdown().wait();
}

#[test]
#[should_panic]
fn test_too_many_predecessors() {
    use crate::Scheduler;

    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();
    let barrier = scheduler.barrier(1);
    let _a = scheduler.job(|_| {}).signal(&barrier).prepare().unwrap();
    let _b = scheduler.job(|_| {}).signal(&barrier).prepare().unwrap();
}

#[test]
fn test_extra_arrival_from_job() {
    use crate::Scheduler;
    use std::sync::mpsc;
    use std::time::Duration;

    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();

    let barrier = scheduler.barrier(1);
    barrier.signal();
    assert!(barrier.is_released());

    // The job's arrival comes after the barrier was released. It is dropped and the
    // worker keeps going.
    let extra = scheduler.job(|_| {}).signal(&barrier).submit().unwrap();
    extra.wait().unwrap();
    assert_eq!(barrier.remaining(), 0);
    assert_eq!(barrier.arrive(), None);
    assert_eq!(barrier.remaining(), 0);

    scheduler.submit_and_wait(|_| {}, crate::JobFlags::NONE).unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = scheduler.shutdown();
    std::thread::spawn(move || {
        handle.wait();
        tx.send(()).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_extra_external_signal() {
    use crate::Scheduler;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();

    let barrier = scheduler.barrier(1);
    barrier.signal();

    assert!(catch_unwind(AssertUnwindSafe(|| barrier.signal())).is_err());
    // The counter did not wrap around.
    assert_eq!(barrier.remaining(), 0);
    assert!(barrier.is_released());

    scheduler.shutdown().wait();
}

#[cfg(loom)]
#[test]
fn test_loom_single_release() {
    loom::model(|| {
        let barrier = Barrier::new(3, Weak::new(), SchedulerId(0));

        let threads: Vec<_> = (0..2).map(|_| {
            let barrier = barrier.clone();
            loom::thread::spawn(move || barrier.arrive())
        }).collect();

        let mut last = (barrier.arrive() == Some(true)) as u32;
        for t in threads {
            last += (t.join().unwrap() == Some(true)) as u32;
        }

        assert_eq!(last, 1);
        assert_eq!(barrier.remaining(), 0);
        assert_eq!(barrier.arrive(), None);
    });
}
