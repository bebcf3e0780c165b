use std::cell::UnsafeCell;
use std::fmt;
use std::ops::BitOr;

use super::barrier::Barrier;
use super::sync::{Ordering, AtomicU64, Mutex, Condvar};

/// Identifies the worker thread a job is running on.
///
/// Indices are dense, from zero to the number of worker threads (excluded), which makes
/// them suitable to pick per-worker resources (see `WorkerData`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub(crate) u32);

impl WorkerId {
    pub fn index(&self) -> usize { self.0 as usize }
}

/// Per-job scheduling flags.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct JobFlags(u8);

impl JobFlags {
    pub const NONE: JobFlags = JobFlags(0);
    /// Put the job back into the ready queue after it runs instead of completing it.
    ///
    /// Useful for poll-style work. The job completes the first time it finishes a run
    /// without this flag (see `JobHandle::set_flags`).
    pub const RESCHEDULE: JobFlags = JobFlags(1);

    pub fn contains(self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool { self.0 == 0 }

    pub fn bits(self) -> u8 { self.0 }
}

impl BitOr for JobFlags {
    type Output = JobFlags;
    fn bitor(self, other: JobFlags) -> JobFlags { JobFlags(self.0 | other.0) }
}

impl fmt::Debug for JobFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            JobFlags::NONE => write!(f, "JobFlags(NONE)"),
            JobFlags::RESCHEDULE => write!(f, "JobFlags(RESCHEDULE)"),
            _ => write!(f, "JobFlags({:#x})", self.0),
        }
    }
}

/// A value-type reference to a job: its slot in the scheduler's arena and the generation
/// of the slot at the time the job was allocated.
///
/// Job slots are recycled, so a given index is reused by several jobs over time. The
/// generation tells them apart.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl JobId {
    pub fn index(&self) -> usize { self.index as usize }
    pub fn generation(&self) -> u32 { self.generation }
}

pub(crate) type JobBody = Box<dyn FnMut(WorkerId) + Send>;

/// The outcome of a job as seen through a given generation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Pending,
    Done,
    Discarded,
}

// The state of a slot packs its generation, the flags of the current job and its phase
// into a single atomic so that reconfiguring a job can't race with recycling its slot.
//
// | generation (32 bits) | unused | flags (8 bits) | phase (2 bits) |
const PHASE_MASK: u64 = 0b11;
const PHASE_PENDING: u64 = 0;
const PHASE_DONE: u64 = 1;
const PHASE_DISCARDED: u64 = 2;
const FLAGS_SHIFT: u32 = 2;
const FLAGS_MASK: u64 = 0xff << FLAGS_SHIFT;
const GENERATION_SHIFT: u32 = 32;

#[derive(Copy, Clone, PartialEq, Eq)]
struct State(u64);

impl State {
    fn new(generation: u32, flags: JobFlags, phase: Phase) -> Self {
        let phase = match phase {
            Phase::Pending => PHASE_PENDING,
            Phase::Done => PHASE_DONE,
            Phase::Discarded => PHASE_DISCARDED,
        };

        let generation = (generation as u64) << GENERATION_SHIFT;
        let flags = (flags.0 as u64) << FLAGS_SHIFT;

        State(generation | flags | phase)
    }

    fn generation(self) -> u32 { (self.0 >> GENERATION_SHIFT) as u32 }

    fn flags(self) -> JobFlags { JobFlags(((self.0 & FLAGS_MASK) >> FLAGS_SHIFT) as u8) }

    fn phase(self) -> Phase {
        match self.0 & PHASE_MASK {
            PHASE_PENDING => Phase::Pending,
            PHASE_DONE => Phase::Done,
            _ => Phase::Discarded,
        }
    }

    /// The phase of the job of a given generation.
    ///
    /// Slots are only recycled after their job completed, so a newer generation means
    /// the older job is done.
    fn phase_of(self, generation: u32) -> Phase {
        if self.generation() != generation {
            return Phase::Done;
        }

        self.phase()
    }
}

/// A job record, stored in the scheduler's arena.
///
/// The body and the barrier are only accessed by whoever currently owns the job: the
/// thread configuring it, then whichever thread popped it from a queue or list. Job ids
/// are in at most one queue at a time, which makes that access exclusive.
pub(crate) struct JobSlot {
    state: AtomicU64,
    body: UnsafeCell<Option<JobBody>>,
    // The barrier that this job's completion counts towards.
    barrier: UnsafeCell<Option<Barrier>>,
    // To block waiters until the job completes.
    mutex: Mutex<()>,
    cond: Condvar,
}

unsafe impl Sync for JobSlot {}

impl JobSlot {
    pub fn new(body: JobBody, flags: JobFlags, barrier: Option<Barrier>) -> Self {
        JobSlot {
            state: AtomicU64::new(State::new(0, flags, Phase::Pending).0),
            body: UnsafeCell::new(Some(body)),
            barrier: UnsafeCell::new(barrier),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Reuse a completed slot for a new job and return the new generation.
    ///
    /// Safety: the caller must have exclusive ownership of the slot, which is the case
    /// after popping it from the finished-job list.
    pub unsafe fn recycle(&self, body: JobBody, flags: JobFlags, barrier: Option<Barrier>) -> u32 {
        let previous = State(self.state.load(Ordering::Acquire));
        debug_assert_eq!(previous.phase(), Phase::Done);

        *self.body.get() = Some(body);
        *self.barrier.get() = barrier;

        let generation = previous.generation().wrapping_add(1);
        self.state.store(State::new(generation, flags, Phase::Pending).0, Ordering::Release);

        generation
    }

    pub fn generation(&self) -> u32 {
        State(self.state.load(Ordering::Acquire)).generation()
    }

    /// The flags of the job of a given generation, empty once it completed.
    pub fn flags(&self, generation: u32) -> JobFlags {
        let state = State(self.state.load(Ordering::Acquire));
        if state.phase_of(generation) != Phase::Pending {
            return JobFlags::NONE;
        }

        state.flags()
    }

    pub fn phase(&self, generation: u32) -> Phase {
        State(self.state.load(Ordering::Acquire)).phase_of(generation)
    }

    /// Change the flags of a pending job.
    ///
    /// Returns false if the job of this generation already completed.
    pub fn set_flags(&self, generation: u32, flags: JobFlags) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = State(current);
            if state.phase_of(generation) != Phase::Pending {
                return false;
            }

            let new = State::new(generation, flags, Phase::Pending);
            let res = self.state
                .compare_exchange_weak(current, new.0, Ordering::AcqRel, Ordering::Acquire);
            match res {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Run the job's body.
    ///
    /// Safety: the caller must own the job (it popped the job from the ready queue).
    pub unsafe fn run(&self, worker: WorkerId) {
        if let Some(body) = (*self.body.get()).as_mut() {
            body(worker);
        }
    }

    /// Take the body and the barrier out of the slot once the job won't run again.
    ///
    /// Safety: the caller must own the job.
    pub unsafe fn take_completion(&self) -> (Option<JobBody>, Option<Barrier>) {
        ((*self.body.get()).take(), (*self.barrier.get()).take())
    }

    /// Publish the final phase of the job of the given generation.
    ///
    /// `notify_waiters` must be called afterwards.
    pub fn finish(&self, generation: u32, phase: Phase) {
        debug_assert!(phase != Phase::Pending);
        self.state.store(State::new(generation, JobFlags::NONE, phase).0, Ordering::Release);
    }

    pub fn notify_waiters(&self) {
        // Taking the lock guarantees that a waiter which observed a pending state is
        // now blocked on the condition variable and will get the notification.
        std::mem::drop(self.mutex.lock().unwrap());
        self.cond.notify_all();
    }

    /// Block until the job of the given generation is done or discarded.
    pub fn wait(&self, generation: u32) -> Phase {
        let phase = self.phase(generation);
        if phase != Phase::Pending {
            return phase;
        }

        profiling::scope!("wait(condvar)");
        let mut guard = self.mutex.lock().unwrap();
        loop {
            let phase = self.phase(generation);
            if phase != Phase::Pending {
                return phase;
            }

            guard = self.cond.wait(guard).unwrap();
        }
    }
}

/// Aborts the process if dropped while unwinding out of a job body or its completion.
///
/// There is no channel to report a job's failure, and letting the worker thread die
/// would leave the job's waiters and successors blocked forever.
pub(crate) struct AbortIfPanic {
    pub job: JobId,
}

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        tracing::error!(job = ?self.job, "job panicked, aborting");
        eprintln!("unexpected panic in job {:?}; aborting", self.job);
        ::std::process::abort();
    }
}

#[test]
fn test_state_packing() {
    let state = State::new(u32::MAX, JobFlags::RESCHEDULE, Phase::Pending);
    assert_eq!(state.generation(), u32::MAX);
    assert_eq!(state.flags(), JobFlags::RESCHEDULE);
    assert_eq!(state.phase(), Phase::Pending);

    let state = State::new(7, JobFlags::NONE, Phase::Discarded);
    assert_eq!(state.generation(), 7);
    assert!(state.flags().is_empty());
    assert_eq!(state.phase_of(7), Phase::Discarded);
    // An older job in a recycled slot.
    assert_eq!(state.phase_of(6), Phase::Done);
}

#[test]
fn test_slot_recycling() {
    let slot = JobSlot::new(Box::new(|_| {}), JobFlags::RESCHEDULE, None);
    assert_eq!(slot.phase(0), Phase::Pending);
    assert!(slot.flags(0).contains(JobFlags::RESCHEDULE));

    assert!(slot.set_flags(0, JobFlags::NONE));
    assert!(slot.flags(0).is_empty());

    unsafe {
        slot.run(WorkerId(0));
        let (body, barrier) = slot.take_completion();
        assert!(body.is_some());
        assert!(barrier.is_none());
    }

    slot.finish(0, Phase::Done);
    slot.notify_waiters();
    assert_eq!(slot.wait(0), Phase::Done);
    assert!(!slot.set_flags(0, JobFlags::RESCHEDULE));

    let generation = unsafe { slot.recycle(Box::new(|_| {}), JobFlags::NONE, None) };
    assert_eq!(generation, 1);
    assert_eq!(slot.phase(1), Phase::Pending);
    assert_eq!(slot.phase(0), Phase::Done);
}
