/// Shutdown
///
/// Workers check whether the scheduler is shutting down by reading an atomic that is set
/// when the shutdown starts, and exit instead of picking up new jobs. Jobs that are
/// already running finish normally. Then we have a simple mutex/condvar pair tracking the
/// remaining number of workers to shut down that we can wait on.
///
/// Everything still in the ready queue is discarded, and so is anything pushed to it
/// afterwards (for example the successors released by a job that was running when the
/// shutdown started).

use crate::sync::{Ordering, AtomicBool, Mutex, Condvar, fence};

use crate::core::Shared;

use std::sync::Arc;

pub(crate) struct Shutdown {
    pub is_shutting_down: AtomicBool,
    pub shutdown_mutex: Mutex<u32>,
    pub shutdown_cond: Condvar,
}

impl Shutdown {
    pub fn new(num_threads: u32) -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            shutdown_mutex: Mutex::new(num_threads),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn begin_shut_down(shared: Arc<Shared>) -> ShutdownHandle {
        shared.shutdown.is_shutting_down.store(true, Ordering::SeqCst);
        // Pairs with the fence in `Shared::push_ready`.
        fence(Ordering::SeqCst);

        shared.sleep.wake_all();

        let discarded = shared.discard_queued();
        let recycled = {
            let mut finished = shared.finished.lock().unwrap();
            let n = finished.len();
            finished.clear();
            n
        };

        tracing::debug!(scheduler = shared.id.0, discarded, recycled, "shutting down");

        ShutdownHandle { shared }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn wait_shutdown(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        while *num_workers > 0 {
            num_workers = self.shutdown_cond.wait(num_workers).unwrap();
        }
    }

    pub fn worker_has_shut_down(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        *num_workers -= 1;
        if *num_workers == 0 {
            self.shutdown_cond.notify_all();
        }
    }
}

/// Returned by `Scheduler::shutdown`, to wait until all worker threads have exited.
pub struct ShutdownHandle {
    shared: Arc<Shared>
}

impl ShutdownHandle {
    pub fn wait(self) {
        self.shared.shutdown.wait_shutdown();

        // Jobs that were running during the shutdown may have released successors.
        let discarded = self.shared.discard_queued();
        if discarded > 0 {
            tracing::debug!(scheduler = self.shared.id.0, discarded, "discarded late jobs");
        }
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::Scheduler;
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..20 {
        for num_threads in 1..31 {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let scheduler = Scheduler::builder()
                .with_worker_threads(num_threads)
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build()
                .unwrap();

            let handle = scheduler.shutdown();
            handle.wait();

            assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), num_threads);
            assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), num_threads);
        }
    }
}

#[test]
fn test_shutdown_discards_queued_jobs() {
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use crate::{Scheduler, JobFlags, Error};

    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    // Keep the only worker busy so that the next jobs stay in the queue.
    let blocker = scheduler.submit(move |_| {
        started_tx.send(()).unwrap();
        resume_rx.recv().unwrap();
    }, JobFlags::NONE).unwrap();

    started_rx.recv().unwrap();

    let executed = Arc::new(AtomicU32::new(0));
    let queued: Vec<_> = (0..16).map(|_| {
        let executed = executed.clone();
        let body = move |_: crate::WorkerId| { executed.fetch_add(1, Ordering::SeqCst); };
        scheduler.submit(body, JobFlags::NONE).unwrap()
    }).collect();

    let handle = scheduler.shutdown();
    assert!(scheduler.is_shutting_down());

    resume_tx.send(()).unwrap();
    handle.wait();

    // The running job completed normally.
    blocker.wait().unwrap();
    assert!(blocker.is_done());

    assert_eq!(executed.load(Ordering::SeqCst), 0);
    for job in &queued {
        assert!(matches!(job.wait(), Err(Error::Discarded(id)) if id == job.id()));
        assert!(!job.is_done());
    }

    assert!(matches!(scheduler.submit(|_| {}, JobFlags::NONE), Err(Error::ShutDown)));
}

#[test]
fn test_job_popped_during_shutdown_is_discarded() {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use crate::core::NextJob;
    use crate::{Scheduler, JobFlags, Error};

    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let blocker = scheduler.submit(move |_| {
        started_tx.send(()).unwrap();
        resume_rx.recv().unwrap();
    }, JobFlags::NONE).unwrap();

    started_rx.recv().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let body = move |_: crate::WorkerId| { r.store(true, Ordering::SeqCst); };
    let queued = scheduler.submit(body, JobFlags::NONE).unwrap();

    // The flag is set but the queue hasn't been drained yet, a worker pops in between.
    let shared = &scheduler.shared;
    shared.shutdown.is_shutting_down.store(true, Ordering::SeqCst);
    assert!(matches!(shared.next_job(), NextJob::ShuttingDown));

    assert!(matches!(queued.wait(), Err(Error::Discarded(id)) if id == queued.id()));
    assert!(!ran.load(Ordering::SeqCst));

    let handle = scheduler.shutdown();
    resume_tx.send(()).unwrap();
    handle.wait();

    blocker.wait().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
}
