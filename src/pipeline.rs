//! Staged pipelines.
//!
//! A pipeline is a sequence of stages where each stage is a group of jobs that run in
//! parallel, and a stage only starts once every job of the previous stage is done.
//!
//! This is only a convenience: the wiring is the same as what one would do by hand with
//! jobs and barriers. Each stage gets a barrier counting its jobs, each job of the stage
//! signals it, and the jobs of the next stage are registered as pending on it. The jobs
//! of the first stage are submitted last, once the whole graph is in place.

use crate::{Barrier, PreparedJob, Result, Scheduler, WorkerId};

/// Builds a pipeline. See `Scheduler::pipeline`.
pub struct Pipeline<'s> {
    scheduler: &'s Scheduler,
    // The jobs of the first stage.
    roots: Vec<PreparedJob>,
    // Released when the last stage so far completes.
    tail: Option<Barrier>,
    stages: u32,
}

impl<'s> Pipeline<'s> {
    pub(crate) fn new(scheduler: &'s Scheduler) -> Self {
        Pipeline {
            scheduler,
            roots: Vec::new(),
            tail: None,
            stages: 0,
        }
    }

    /// Add a stage made of jobs that run in parallel.
    ///
    /// Empty stages are ignored.
    pub fn parallel<F, I>(mut self, bodies: I) -> Result<Self>
    where
        F: FnMut(WorkerId) + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        let bodies: Vec<F> = bodies.into_iter().collect();
        if bodies.is_empty() {
            return Ok(self);
        }

        let barrier = self.scheduler.barrier(bodies.len() as u32);

        for body in bodies {
            let job = self.scheduler.job(body).signal(&barrier);
            match &self.tail {
                Some(previous) => {
                    job.after(previous)?;
                }
                None => {
                    self.roots.push(job.prepare()?);
                }
            }
        }

        self.tail = Some(barrier);
        self.stages += 1;

        Ok(self)
    }

    /// Add a stage made of a single job.
    pub fn then<F>(self, body: F) -> Result<Self>
    where F: FnMut(WorkerId) + Send + 'static
    {
        self.parallel(std::iter::once(body))
    }

    pub fn num_stages(&self) -> u32 { self.stages }

    /// The barrier released when the last stage added so far completes.
    pub fn barrier(&self) -> Option<&Barrier> {
        self.tail.as_ref()
    }

    /// Submit the first stage.
    ///
    /// If this fails the jobs that were not submitted are discarded, which discards the
    /// following stages as well.
    pub fn submit(self) -> Result<PipelineHandle> {
        let done = match self.tail {
            Some(barrier) => barrier,
            None => self.scheduler.barrier(0),
        };

        tracing::trace!(
            barrier = done.id(),
            stages = self.stages,
            roots = self.roots.len(),
            "submitting pipeline",
        );

        for root in self.roots {
            root.submit()?;
        }

        Ok(PipelineHandle { done })
    }
}

/// A reference to a submitted pipeline.
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    done: Barrier,
}

impl PipelineHandle {
    /// Block until every stage is done.
    ///
    /// Returns an error if one of the jobs was discarded.
    pub fn wait(&self) -> Result<()> {
        self.done.wait()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_released()
    }

    /// The barrier released when the last stage completes, to chain more work.
    pub fn barrier(&self) -> &Barrier {
        &self.done
    }
}

#[test]
fn test_fan_in_with_barrier() {
    use crate::{JobFlags, JobHandle};
    use std::sync::{Arc, Mutex, mpsc};

    let scheduler = Scheduler::builder().with_worker_threads(3).build().unwrap();

    for _ in 0..200 {
        let (callback_tx, callback_rx) = mpsc::channel();
        let stage1: Arc<Mutex<Vec<JobHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let barrier = scheduler.barrier(4);

        let predecessors = stage1.clone();
        let terminal = scheduler.job(move |_| {
            for handle in predecessors.lock().unwrap().iter() {
                assert!(handle.is_done());
            }
            callback_tx.send(()).unwrap();
        }).after(&barrier).unwrap();

        let prepared: Vec<_> = (0..4).map(|_| {
            scheduler.job(|_| { std::hint::black_box(0u64); })
                .with_flags(JobFlags::NONE)
                .signal(&barrier)
                .prepare()
                .unwrap()
        }).collect();

        stage1.lock().unwrap().extend(prepared.iter().map(|job| job.handle()));

        for job in prepared {
            job.submit().unwrap();
        }

        terminal.wait().unwrap();
        callback_rx.recv().unwrap();

        for handle in stage1.lock().unwrap().iter() {
            assert!(handle.is_done());
        }

        scheduler.wait_all();
        // The callback fired exactly once.
        assert!(callback_rx.try_recv().is_err());
    }

    scheduler.shutdown().wait();
}

#[test]
fn test_multi_stage_pipeline() {
    use crate::WorkerData;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    let scheduler = Scheduler::builder().with_worker_threads(4).build().unwrap();

    for _ in 0..50 {
        let decoded = Arc::new(AtomicU32::new(0));
        let synced = Arc::new(AtomicBool::new(false));
        let consumed = Arc::new(AtomicU32::new(0));
        let out_of_order = Arc::new(AtomicBool::new(false));
        let scratch = WorkerData::new(&scheduler, |_| Vec::<u32>::with_capacity(16));

        let decode = (0..8u32).map(|i| {
            let decoded = decoded.clone();
            let scratch = scratch.clone();
            move |worker: WorkerId| {
                scratch.with(worker, |buf| buf.push(i));
                decoded.fetch_add(1, Ordering::SeqCst);
            }
        });

        let sync = {
            let decoded = decoded.clone();
            let synced = synced.clone();
            let out_of_order = out_of_order.clone();
            move |_: WorkerId| {
                if decoded.load(Ordering::SeqCst) != 8 {
                    out_of_order.store(true, Ordering::SeqCst);
                }
                synced.store(true, Ordering::SeqCst);
            }
        };

        let consume = (0..4).map(|_| {
            let synced = synced.clone();
            let consumed = consumed.clone();
            let out_of_order = out_of_order.clone();
            move |_: WorkerId| {
                if !synced.load(Ordering::SeqCst) {
                    out_of_order.store(true, Ordering::SeqCst);
                }
                consumed.fetch_add(1, Ordering::SeqCst);
            }
        });

        let finalize = {
            let consumed = consumed.clone();
            let out_of_order = out_of_order.clone();
            move |_: WorkerId| {
                if consumed.load(Ordering::SeqCst) != 4 {
                    out_of_order.store(true, Ordering::SeqCst);
                }
            }
        };

        let pipeline = scheduler.pipeline()
            .parallel(decode).unwrap()
            .then(sync).unwrap()
            .parallel(consume).unwrap()
            .parallel(Vec::<fn(WorkerId)>::new()).unwrap()
            .then(finalize).unwrap();

        assert_eq!(pipeline.num_stages(), 4);

        let handle = pipeline.submit().unwrap();
        handle.wait().unwrap();
        assert!(handle.is_done());

        assert!(!out_of_order.load(Ordering::SeqCst));
        assert_eq!(consumed.load(Ordering::SeqCst), 4);

        let mut scratch = scratch;
        let mut total = 0;
        assert!(scratch.for_each_mut(|_, buf| total += buf.len()));
        assert_eq!(total, 8);
    }

    scheduler.shutdown().wait();
}

#[test]
fn test_empty_pipeline() {
    let scheduler = Scheduler::builder().with_worker_threads(1).build().unwrap();

    let handle = scheduler.pipeline().submit().unwrap();
    assert!(handle.is_done());
    handle.wait().unwrap();

    scheduler.shutdown().wait();
}

#[test]
fn test_abandoned_pipeline() {
    use crate::Error;

    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();

    let pipeline = scheduler.pipeline()
        .parallel((0..3).map(|_| |_: WorkerId| {})).unwrap()
        .then(|_| { panic!("must not run"); }).unwrap();

    let done = pipeline.barrier().cloned().unwrap();

    scheduler.shutdown().wait();

    assert!(matches!(pipeline.submit(), Err(Error::ShutDown)));
    assert!(done.is_abandoned());
    assert!(matches!(done.wait(), Err(Error::Abandoned(_))));
}
