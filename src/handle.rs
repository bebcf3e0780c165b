//! Handles are references to submitted or prepared jobs.
//!
//! A job goes through a builder (`JobBuilder`), optionally a prepared state in which it
//! is allocated but not in the ready queue yet (`PreparedJob`), and is then observed via
//! a `JobHandle`.
//!
//! Handles hold a strong reference to the scheduler's shared state, which owns the job
//! records. Job records are recycled once their job completes, so handles identify their
//! job with an index and a generation: a handle to an old job never observes the job that
//! reused its slot.

use crate::core::Shared;
use crate::core::barrier::Barrier;
use crate::core::job::{JobBody, JobFlags, JobId, Phase};
use crate::core::scheduler::SchedulerId;
use crate::{Error, Result, Scheduler};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A builder for jobs. See `Scheduler::job`.
pub struct JobBuilder<'s> {
    scheduler: &'s Scheduler,
    body: JobBody,
    flags: JobFlags,
    barrier: Option<Barrier>,
}

impl<'s> JobBuilder<'s> {
    pub(crate) fn new(scheduler: &'s Scheduler, body: JobBody) -> Self {
        JobBuilder {
            scheduler,
            body,
            flags: JobFlags::NONE,
            barrier: None,
        }
    }

    #[inline]
    pub fn with_flags(mut self, flags: JobFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Deliver an arrival to the barrier when the job completes.
    ///
    /// A job signals at most one barrier. The number of jobs signaling a barrier must
    /// not exceed the count it was created with.
    #[inline]
    pub fn signal(mut self, barrier: &Barrier) -> Self {
        self.barrier = Some(barrier.clone());
        self
    }

    /// Allocate the job without submitting it.
    pub fn prepare(self) -> Result<PreparedJob> {
        let shared = &self.scheduler.shared;

        if let Some(barrier) = &self.barrier {
            assert_eq!(
                barrier.scheduler_id(), shared.id,
                "barrier {} belongs to another scheduler", barrier.id(),
            );
            barrier.attach();
        }

        if shared.shutdown.is_shutting_down() {
            // The arrival we promised will never come.
            if let Some(barrier) = &self.barrier {
                barrier.abandon(shared);
            }

            return Err(Error::ShutDown);
        }

        let id = shared.acquire_job(self.body, self.flags, self.barrier);

        Ok(PreparedJob {
            handle: JobHandle { shared: Arc::clone(shared), id },
            armed: true,
        })
    }

    /// Submit the job to the ready queue.
    pub fn submit(self) -> Result<JobHandle> {
        self.prepare()?.submit()
    }

    /// Submit the job once the barrier is released.
    pub fn after(self, barrier: &Barrier) -> Result<JobHandle> {
        let job = self.prepare()?;
        Ok(barrier.add_pending(job))
    }
}

/// An allocated job that is not in the ready queue yet.
///
/// Either submit it directly or hand it to `Barrier::add_pending`. Dropping it discards
/// the job.
pub struct PreparedJob {
    handle: JobHandle,
    armed: bool,
}

impl PreparedJob {
    /// A handle to observe the job once it is submitted.
    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> JobId {
        self.handle.id
    }

    pub fn submit(mut self) -> Result<JobHandle> {
        self.armed = false;
        let handle = self.handle.clone();

        if handle.shared.shutdown.is_shutting_down() {
            handle.shared.discard(handle.id);
            return Err(Error::ShutDown);
        }

        handle.shared.push_ready(handle.id);

        Ok(handle)
    }

    /// Take the ownership of the job away from this prepared job, so that dropping it
    /// doesn't discard the job.
    pub(crate) fn disarm(mut self) -> JobHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for PreparedJob {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!(job = ?self.handle.id, "prepared job dropped without being submitted");
        self.handle.shared.discard(self.handle.id);
    }
}

impl fmt::Debug for PreparedJob {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PreparedJob").field(&self.handle.id).finish()
    }
}

/// A reference to a job, to wait for it or change its flags.
///
/// Handles can be cloned and sent to other threads.
#[derive(Clone)]
pub struct JobHandle {
    pub(crate) shared: Arc<Shared>,
    id: JobId,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn scheduler_id(&self) -> SchedulerId {
        self.shared.id
    }

    /// Block until the job is done.
    ///
    /// Returns an error if the job was discarded instead.
    pub fn wait(&self) -> Result<()> {
        profiling::scope!("JobHandle::wait");
        match self.shared.jobs.get(self.id.index()).wait(self.id.generation) {
            Phase::Discarded => Err(Error::Discarded(self.id)),
            _ => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase() == Phase::Done
    }

    pub fn is_discarded(&self) -> bool {
        self.phase() == Phase::Discarded
    }

    /// The current flags of the job. Empty once the job completed.
    pub fn flags(&self) -> JobFlags {
        self.shared.jobs.get(self.id.index()).flags(self.id.generation)
    }

    /// Change the flags of the job.
    ///
    /// This takes effect the next time the job finishes running: clearing `RESCHEDULE`
    /// lets a polling job complete. Returns false if the job already completed.
    pub fn set_flags(&self, flags: JobFlags) -> bool {
        self.shared.jobs.get(self.id.index()).set_flags(self.id.generation, flags)
    }

    fn phase(&self) -> Phase {
        self.shared.jobs.get(self.id.index()).phase(self.id.generation)
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.shared.id == other.shared.id
    }
}

impl Eq for JobHandle {}

impl Hash for JobHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("scheduler", &self.shared.id)
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[test]
fn test_prepared_job() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let prepared = scheduler.job(move |_| { r.store(true, Ordering::SeqCst); }).prepare().unwrap();
    let handle = prepared.handle();
    assert_eq!(handle.id(), prepared.id());

    // Not in the ready queue yet.
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!handle.is_done());

    let submitted = prepared.submit().unwrap();
    assert_eq!(submitted, handle);
    submitted.wait().unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert!(handle.is_done());

    scheduler.shutdown().wait();
}

#[test]
fn test_dropped_prepared_job() {
    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();

    let prepared = scheduler.job(|_| { panic!("must not run"); }).prepare().unwrap();
    let handle = prepared.handle();
    std::mem::drop(prepared);

    assert!(handle.is_discarded());
    assert!(matches!(handle.wait(), Err(Error::Discarded(id)) if id == handle.id()));
    // Discarded slots aren't recycled.
    assert_eq!(scheduler.recycled_jobs(), 0);

    scheduler.shutdown().wait();
}

#[test]
fn test_handles_from_other_threads() {
    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let handle = scheduler.submit(move |_| { rx.recv().unwrap(); }, JobFlags::NONE).unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let handle = handle.clone();
            s.spawn(move || handle.wait().unwrap());
        }

        tx.send(()).unwrap();
    });

    assert!(handle.is_done());

    scheduler.shutdown().wait();
}
