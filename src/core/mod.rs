pub mod job;
pub mod barrier;
pub mod scheduler;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::{Backoff, CachePadded, sync::{Parker, Unparker}};

use std::sync::Arc;
use std::thread;

use sync::{Ordering, AtomicU32, AtomicUsize, Mutex, Condvar, fence};
use job::{AbortIfPanic, JobBody, JobFlags, JobId, JobSlot, Phase, WorkerId};
use barrier::Barrier;
use scheduler::{Scheduler, SchedulerBuilder, SchedulerId};
use shutdown::Shutdown;
use crate::arena::Arena;
use crate::{Error, Result};

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_SCHEDULER_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// Data accessible from the scheduler handles, the job handles and the worker threads.
///
/// The job records live in `jobs`, so this is kept alive until every worker thread has
/// exited and every handle is gone.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// Storage for the job records. Slots are recycled through `finished`.
    pub jobs: Arena<JobSlot>,
    /// Jobs that are ready to run.
    pub ready: ReadyQueue,
    /// Indices of completed job slots available for reuse.
    pub finished: Mutex<Vec<u32>>,
    /// State and logic to put worker threads to sleep and wake them up.
    pub sleep: Sleep,
    /// A unique ID per scheduler to sanity-check that jobs and barriers aren't mixed
    /// between schedulers.
    pub id: SchedulerId,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    // A few hooks to register work
    handlers: WorkerHooks,
}

pub(crate) fn init(params: SchedulerBuilder) -> Result<Scheduler> {
    let num_threads = params.num_threads as usize;

    let (sleep, parkers) = Sleep::new(num_threads);

    let shared = Arc::new(Shared {
        num_workers: num_threads as u32,
        jobs: Arena::with_page_size(params.arena_page_size),
        ready: ReadyQueue::new(),
        finished: Mutex::new(Vec::new()),
        sleep,
        id: SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed)),
        shutdown: Shutdown::new(num_threads as u32),
        handlers: WorkerHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    for (i, parker) in parkers.into_iter().enumerate() {
        let mut worker = Worker {
            id: WorkerId(i as u32),
            parker,
            shared: shared.clone(),
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let spawned = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();
        });

        if let Err(source) = spawned {
            tracing::error!(worker = i, error = %source, "failed to spawn worker thread");

            // The workers that were never spawned won't report their exit.
            for _ in i..num_threads {
                shared.shutdown.worker_has_shut_down();
            }
            Shutdown::begin_shut_down(shared.clone()).wait();

            return Err(Error::Spawn { index: i as u32, source });
        }
    }

    tracing::debug!(scheduler = shared.id.0, workers = num_threads, "scheduler started");

    Ok(Scheduler { shared })
}

impl Shared {
    /// Allocate and configure a job, reusing a completed slot if there is one.
    pub fn acquire_job(&self, body: JobBody, flags: JobFlags, barrier: Option<Barrier>) -> JobId {
        let recycled = self.finished.lock().unwrap().pop();

        match recycled {
            Some(index) => {
                let slot = self.jobs.get(index as usize);
                // Popping the index from the finished list gives us exclusive access.
                let generation = unsafe { slot.recycle(body, flags, barrier) };

                JobId { index, generation }
            }
            None => {
                let (index, _) = self.jobs.emplace(JobSlot::new(body, flags, barrier));
                assert!(index <= u32::MAX as usize, "too many jobs allocated");

                JobId { index: index as u32, generation: 0 }
            }
        }
    }

    /// Add a job to the ready queue and wake a worker up.
    ///
    /// If the scheduler is shutting down the job is discarded instead.
    pub fn push_ready(&self, job: JobId) {
        profiling::scope!("push_ready");

        if self.shutdown.is_shutting_down() {
            self.discard(job);
            return;
        }

        self.ready.push(job);

        // Pairs with the fence in the worker loop after it marks itself sleepy, and with
        // the one in `Shutdown::begin_shut_down`: either they see the job in the queue or
        // we see their store.
        fence(Ordering::SeqCst);

        if self.shutdown.is_shutting_down() {
            self.discard_queued();
            return;
        }

        self.sleep.wake(1);
    }

    /// Run a job popped from the ready queue on the current worker thread.
    pub fn execute(&self, job: JobId, worker: WorkerId) {
        let slot = self.jobs.get(job.index());

        // Covers the completion as well: a worker that unwinds never reports its exit
        // to the shutdown code.
        let abort = AbortIfPanic { job };

        {
            profiling::scope!("execute_job");
            unsafe {
                slot.run(worker);
            }
        }

        if slot.flags(job.generation).contains(JobFlags::RESCHEDULE) {
            self.push_ready(job);
        } else {
            self.complete(job);
        }

        std::mem::forget(abort);
    }

    /// Pop a job to run unless the scheduler is shutting down.
    fn next_job(&self) -> NextJob {
        if self.shutdown.is_shutting_down() {
            return NextJob::ShuttingDown;
        }

        let job = match self.ready.pop() {
            Some(job) => job,
            None => return NextJob::Empty,
        };

        // The shutdown may have started between the check and the pop. The job was still
        // queued at that point, so it must not run.
        if self.shutdown.is_shutting_down() {
            self.discard(job);
            return NextJob::ShuttingDown;
        }

        NextJob::Job(job)
    }

    /// Mark a job done, recycle its slot and deliver its arrival to its barrier, if any.
    fn complete(&self, job: JobId) {
        let slot = self.jobs.get(job.index());
        let (body, barrier) = unsafe { slot.take_completion() };
        // Drop captured state before waking waiters up.
        std::mem::drop(body);

        {
            // Publish under the lock so that the slot can be found in the finished list
            // as soon as a waiter returns.
            let mut finished = self.finished.lock().unwrap();
            slot.finish(job.generation, Phase::Done);
            finished.push(job.index);
        }

        // The slot may already be reused at this point, in which case this is a spurious
        // wake up for the waiters of the new job.
        slot.notify_waiters();

        if let Some(barrier) = barrier {
            match barrier.arrive() {
                Some(true) => barrier.release(self),
                Some(false) => {}
                None => {
                    // Someone signaled the barrier manually on top of its jobs. Dropping
                    // the extra arrival keeps the worker alive.
                    tracing::error!(
                        barrier = barrier.id(),
                        count = barrier.count(),
                        ?job,
                        "barrier signaled more times than its count, ignoring the arrival",
                    );
                }
            }
        }
    }

    /// Drop a job without running it.
    ///
    /// Must only be called by the owner of the job. The job's barrier can't be released
    /// anymore, so it is abandoned.
    pub fn discard(&self, job: JobId) {
        let slot = self.jobs.get(job.index());
        debug_assert_eq!(slot.generation(), job.generation);

        let (body, barrier) = unsafe { slot.take_completion() };
        std::mem::drop(body);

        slot.finish(job.generation, Phase::Discarded);
        slot.notify_waiters();

        if let Some(barrier) = barrier {
            barrier.abandon(self);
        }
    }

    /// Discard everything in the ready queue. Returns the number of discarded jobs.
    pub fn discard_queued(&self) -> usize {
        let mut discarded = 0;
        while let Some(job) = self.ready.pop() {
            self.discard(job);
            discarded += 1;
        }

        discarded
    }
}

enum NextJob {
    Job(JobId),
    Empty,
    ShuttingDown,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Only reachable once all handles are gone, nobody can observe these jobs. Their
        // bodies are dropped along with the arena.
        let leftover = self.ready.len();
        if leftover > 0 {
            tracing::debug!(scheduler = self.id.0, leftover, "dropping queued jobs");
        }
    }
}

/// The shared queue of jobs that are ready to run.
pub(crate) struct ReadyQueue {
    jobs: Injector<JobId>,
    // Number of jobs in the queue, to be able to block until it is drained.
    len: AtomicUsize,
    drained_mutex: Mutex<()>,
    drained_cond: Condvar,
}

impl ReadyQueue {
    fn new() -> Self {
        ReadyQueue {
            jobs: Injector::new(),
            len: AtomicUsize::new(0),
            drained_mutex: Mutex::new(()),
            drained_cond: Condvar::new(),
        }
    }

    pub fn push(&self, job: JobId) {
        self.len.fetch_add(1, Ordering::SeqCst);
        self.jobs.push(job);
    }

    pub fn pop(&self) -> Option<JobId> {
        let backoff = Backoff::new();
        loop {
            match self.jobs.steal() {
                Steal::Success(job) => {
                    if self.len.fetch_sub(1, Ordering::AcqRel) == 1 {
                        std::mem::drop(self.drained_mutex.lock().unwrap());
                        self.drained_cond.notify_all();
                    }

                    return Some(job);
                }
                Steal::Empty => {
                    return None;
                }
                Steal::Retry => {
                    backoff.spin();
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Block until the queue has been observed empty.
    pub fn wait_drained(&self) {
        profiling::scope!("wait_drained");
        let mut guard = self.drained_mutex.lock().unwrap();
        while self.len.load(Ordering::Acquire) > 0 {
            guard = self.drained_cond.wait(guard).unwrap();
        }
    }
}

pub(crate) struct Sleep {
    /// Atomic bitfield. Setting the Nth bit to one means the Nth worker thread is sleepy.
    sleepy_workers: AtomicU32,
    unparkers: Vec<CachePadded<Unparker>>,
}

impl Sleep {
    fn new(num_threads: usize) -> (Self, Vec<Parker>) {
        let mut parkers = Vec::with_capacity(num_threads);
        let mut unparkers = Vec::with_capacity(num_threads);

        for _ in 0..num_threads {
            let parker = Parker::new();
            unparkers.push(CachePadded::new(parker.unparker().clone()));
            parkers.push(parker);
        }

        (
            Sleep {
                // Workers start awake and mark themselves sleepy when they run out of work.
                sleepy_workers: AtomicU32::new(0),
                unparkers,
            },
            parkers,
        )
    }

    /// Wake up to n worker threads (stop when they are all awake).
    ///
    /// This function is fairly expensive when it causes a thread to
    /// wake up.
    /// However it is fairly cheap if all workers are already awake.
    pub fn wake(&self, mut n: u32) {
        while n > 0 {
            let mut sleepy_bits = self.sleepy_workers.load(Ordering::Acquire);

            if sleepy_bits == 0 {
                // Everyone is already awake.
                return;
            }

            profiling::scope!("wake workers");

            for i in 0..(self.unparkers.len() as u32) {
                let bit = 1 << i;
                if sleepy_bits & bit == 0 {
                    continue;
                }

                let prev = self.sleepy_workers.fetch_and(!bit, Ordering::Release);
                if prev & bit == 0 {
                    // Someone else woke the thread up before we got to it.
                    // A good time to refresh our view of the sleep thread bits.
                    sleepy_bits = self.sleepy_workers.load(Ordering::Acquire);

                    if sleepy_bits == 0 {
                        return;
                    }

                    continue;
                }

                self.unparkers[i as usize].unpark();

                n -= 1;
                break;
            }
        }
    }

    fn mark_sleepy(&self, worker: u32) {
        self.sleepy_workers.fetch_or(1 << worker, Ordering::SeqCst);
    }

    fn mark_awake(&self, worker: u32) {
        self.sleepy_workers.fetch_and(!(1 << worker), Ordering::Release);
    }

    /// Wake all workers.
    ///
    /// This is a bit heavy handed and mostly intended for the shutdown code. In the majority
    /// of cases (other than shutdown), using `wake` is better.
    fn wake_all(&self) {
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }
}

struct Worker {
    id: WorkerId,
    parker: Parker,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        let _span = tracing::trace_span!("worker", index = self.id.0).entered();

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.id);
        }

        tracing::trace!("worker started");

        loop {
            // Queued jobs are dropped by the shutdown code, don't start new ones.
            match shared.next_job() {
                NextJob::Job(job) => {
                    shared.execute(job, self.id);
                    continue;
                }
                NextJob::ShuttingDown => break,
                NextJob::Empty => {}
            }

            // Couldn't find work to do, so it's sleepy time.
            shared.sleep.mark_sleepy(self.id.0);

            // A job may have been pushed after we looked at the queue but before the
            // sleepy bit was visible to the pusher, check again before parking.
            fence(Ordering::SeqCst);
            if !shared.ready.is_empty() || shared.shutdown.is_shutting_down() {
                shared.sleep.mark_awake(self.id.0);
                continue;
            }

            {
                profiling::scope!("park");
                self.parker.park();
            }

            // Whoever woke us cleared our bit, unless it was a spurious wake up or the
            // shutdown.
            shared.sleep.mark_awake(self.id.0);
        }

        // Shutdown phase.

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.id);
        }

        tracing::trace!("worker exiting");

        shared.shutdown.worker_has_shut_down();
    }
}

pub(crate) struct WorkerHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

/// A callback invoked on worker threads when they start or exit.
pub trait WorkerHook: Send + Sync {
    fn run(&self, worker: WorkerId);
}

impl<F> WorkerHook for F where F: Fn(WorkerId) + Send + Sync + 'static {
    fn run(&self, worker: WorkerId) { self(worker) }
}
