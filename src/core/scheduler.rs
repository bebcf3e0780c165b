use super::{Shared, WorkerHook};
use super::barrier::Barrier;
use super::job::{JobFlags, WorkerId};
use super::shutdown::{Shutdown, ShutdownHandle};
use crate::arena::DEFAULT_PAGE_SIZE;
use crate::handle::{JobBuilder, JobHandle};
use crate::pipeline::Pipeline;
use crate::Result;

use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SchedulerId(pub(crate) u32);

/// A reference to a pool of worker threads and its ready queue.
///
/// Cloning is cheap and clones refer to the same scheduler. Dropping the last reference
/// does not stop the workers: call `shutdown`.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4)
            .saturating_sub(1)
            .clamp(1, SchedulerBuilder::MAX_WORKER_THREADS);

        SchedulerBuilder {
            num_threads,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
            arena_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Start configuring a job.
    ///
    /// The body receives the index of the worker thread it runs on.
    pub fn job<F>(&self, body: F) -> JobBuilder<'_>
    where F: FnMut(WorkerId) + Send + 'static
    {
        JobBuilder::new(self, Box::new(body))
    }

    /// Submit a job to run as soon as a worker is available.
    pub fn submit<F>(&self, body: F, flags: JobFlags) -> Result<JobHandle>
    where F: FnMut(WorkerId) + Send + 'static
    {
        self.job(body).with_flags(flags).submit()
    }

    /// Submit a job and block until it is done.
    ///
    /// Note that a job with the `RESCHEDULE` flag only completes once something else
    /// clears the flag.
    pub fn submit_and_wait<F>(&self, body: F, flags: JobFlags) -> Result<()>
    where F: FnMut(WorkerId) + Send + 'static
    {
        self.submit(body, flags)?.wait()
    }

    /// Create a barrier that releases its pending jobs after `count` arrivals.
    pub fn barrier(&self, count: u32) -> Barrier {
        Barrier::new(count, Arc::downgrade(&self.shared), self.shared.id)
    }

    /// Start building a staged pipeline.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Block until the ready queue has been drained.
    ///
    /// This does not wait for the jobs that are still running, nor for the jobs they
    /// may release afterwards.
    pub fn wait_all(&self) {
        self.shared.ready.wait_drained();
    }

    /// Stop the worker threads.
    ///
    /// Jobs that haven't started yet are discarded, and so is anything submitted from now
    /// on. Jobs that are running complete normally. Use the returned handle to wait for
    /// the worker threads to exit.
    pub fn shutdown(&self) -> ShutdownHandle {
        Shutdown::begin_shut_down(Arc::clone(&self.shared))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_shutting_down()
    }

    pub fn id(&self) -> SchedulerId {
        self.shared.id
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    /// Number of job records allocated so far. Completed jobs are recycled so this
    /// stays flat under a steady submit/complete load.
    pub fn allocated_jobs(&self) -> usize { self.shared.jobs.len() }

    /// Number of completed job records available for reuse.
    pub fn recycled_jobs(&self) -> usize {
        self.shared.finished.lock().unwrap().len()
    }
}

pub struct SchedulerBuilder {
    pub(crate) num_threads: u32,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) arena_page_size: usize,
}

impl SchedulerBuilder {
    /// Sleeping workers are tracked in a 32 bits bitfield.
    pub const MAX_WORKER_THREADS: u32 = 31;

    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(WorkerId) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));
        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(WorkerId) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);
        self
    }

    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads.clamp(1, Self::MAX_WORKER_THREADS);
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Number of job records per page of the job arena.
    pub fn with_arena_page_size(mut self, page_size: usize) -> Self {
        self.arena_page_size = page_size.max(1);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        crate::core::init(self)
    }
}

#[test]
fn test_submit_and_wait() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(3).build().unwrap();
    assert_eq!(scheduler.num_worker_threads(), 3);

    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    scheduler.submit_and_wait(move |worker| {
        assert!(worker.index() < 3);
        c.fetch_add(1, Ordering::SeqCst);
    }, JobFlags::NONE).unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let mut handles = Vec::new();
    for _ in 0..10_000 {
        let c = counter.clone();
        let body = move |_: WorkerId| { c.fetch_add(1, Ordering::Relaxed); };
        let handle = scheduler.submit(body, JobFlags::NONE);
        handles.push(handle.unwrap());
    }

    for handle in &handles {
        handle.wait().unwrap();
        assert!(handle.is_done());
    }

    assert_eq!(counter.load(Ordering::SeqCst), 10_001);

    scheduler.shutdown().wait();
}

#[test]
fn test_wait_is_prompt() {
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    let mut worst = Duration::ZERO;
    for _ in 0..20 {
        let finished_at = Arc::new(Mutex::new(None));
        let f = finished_at.clone();
        let handle = scheduler.submit(move |_| {
            std::thread::sleep(Duration::from_millis(2));
            *f.lock().unwrap() = Some(Instant::now());
        }, JobFlags::NONE).unwrap();

        handle.wait().unwrap();
        let woken_at = Instant::now();
        assert!(handle.is_done());

        let finished_at = finished_at.lock().unwrap().unwrap();
        worst = worst.max(woken_at.duration_since(finished_at));
    }

    // Waiters are notified on completion, not polled.
    assert!(worst < Duration::from_millis(50), "slowest wake up: {:?}", worst);

    scheduler.shutdown().wait();
}

#[test]
fn test_job_recycling() {
    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    let first = scheduler.submit(|_| {}, JobFlags::NONE).unwrap();
    first.wait().unwrap();
    assert!(first.is_done());
    assert_eq!(scheduler.recycled_jobs(), 1);
    assert_eq!(scheduler.allocated_jobs(), 1);

    // The next job takes the slot of the previous one.
    let second = scheduler.submit(|_| {}, JobFlags::NONE).unwrap();
    assert_eq!(second.id().index(), first.id().index());
    assert_ne!(second.id(), first.id());
    assert_ne!(second, first);
    second.wait().unwrap();

    // The old handle still reports its own job as done.
    assert!(first.is_done());
    first.wait().unwrap();

    for _ in 0..1000 {
        scheduler.submit_and_wait(|_| {}, JobFlags::NONE).unwrap();
    }

    assert_eq!(scheduler.allocated_jobs(), 1);

    scheduler.shutdown().wait();
}

#[test]
fn test_rescheduled_job() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    let runs = Arc::new(AtomicU32::new(0));
    let r = runs.clone();
    let poll = scheduler
        .submit(move |_| { r.fetch_add(1, Ordering::SeqCst); }, JobFlags::RESCHEDULE)
        .unwrap();
    assert_eq!(poll.flags(), JobFlags::RESCHEDULE);

    while runs.load(Ordering::SeqCst) < 10 {
        assert!(!poll.is_done());
        std::thread::yield_now();
    }
    assert!(!poll.is_done());

    assert!(poll.set_flags(JobFlags::NONE));
    poll.wait().unwrap();
    assert!(poll.is_done());
    assert!(!poll.set_flags(JobFlags::RESCHEDULE));

    let total = runs.load(Ordering::SeqCst);
    scheduler.wait_all();
    assert_eq!(runs.load(Ordering::SeqCst), total);

    scheduler.shutdown().wait();
}

#[test]
fn test_rescheduled_job_until_shutdown() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::Error;

    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();

    let runs = Arc::new(AtomicU32::new(0));
    let r = runs.clone();
    let poll = scheduler
        .submit(move |_| { r.fetch_add(1, Ordering::SeqCst); }, JobFlags::RESCHEDULE)
        .unwrap();

    while runs.load(Ordering::SeqCst) < 3 {
        std::thread::yield_now();
    }

    scheduler.shutdown().wait();

    assert!(matches!(poll.wait(), Err(Error::Discarded(_))));
    assert!(!poll.is_done());
    assert!(poll.is_discarded());
}

#[test]
fn test_wait_all() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(3).build().unwrap();
    let counter = Arc::new(AtomicU32::new(0));

    for _ in 0..1000 {
        let c = counter.clone();
        scheduler.submit(move |_| { c.fetch_add(1, Ordering::Relaxed); }, JobFlags::NONE).unwrap();
    }

    scheduler.wait_all();
    assert_eq!(scheduler.shared.ready.len(), 0);

    scheduler.shutdown().wait();
}

#[test]
fn test_worker_ids() {
    use std::sync::Mutex;

    let scheduler = Scheduler::builder()
        .with_worker_threads(4)
        .with_thread_names(|idx| format!("Decoder#{}", idx))
        .with_arena_page_size(16)
        .build()
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..200).map(|_| {
        let seen = seen.clone();
        scheduler.submit(move |worker| {
            let name = std::thread::current().name().map(String::from);
            assert_eq!(name, Some(format!("Decoder#{}", worker.index())));
            seen.lock().unwrap().push(worker.index());
        }, JobFlags::NONE).unwrap()
    }).collect();

    for handle in handles {
        handle.wait().unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 200);
    assert!(seen.iter().all(|idx| *idx < 4));

    scheduler.shutdown().wait();
}
