//! Helpers to build high level execution patterns on top of the core.

use crate::{Scheduler, SchedulerId, WorkerId};
use crossbeam_utils::CachePadded;

use std::sync::{Arc, Mutex};

/// One item per worker thread, accessible from jobs running on that worker.
///
/// This can be useful to store and reuse some scratch buffers or accumulators and avoid
/// memory allocations and contention in job bodies.
///
/// A worker runs one job at a time, so the lock of a given item is uncontended as long
/// as it is only accessed via the `WorkerId` passed to the job body. Items are padded to
/// avoid false sharing.
///
/// Cloning is cheap and clones refer to the same items, so that each job body can
/// capture its own clone.
pub struct WorkerData<T> {
    items: Arc<Vec<CachePadded<Mutex<T>>>>,
    scheduler: SchedulerId,
}

impl<T> Clone for WorkerData<T> {
    fn clone(&self) -> Self {
        WorkerData { items: self.items.clone(), scheduler: self.scheduler }
    }
}

impl<T: Send> WorkerData<T> {
    /// Create one item per worker thread of the scheduler.
    pub fn new(scheduler: &Scheduler, mut init: impl FnMut(WorkerId) -> T) -> Self {
        let items: Vec<T> = (0..scheduler.num_worker_threads())
            .map(|idx| init(WorkerId(idx)))
            .collect();

        WorkerData::from_vec(items, scheduler)
    }

    pub fn from_vec(items: Vec<T>, scheduler: &Scheduler) -> Self {
        let count = items.len();
        let min = scheduler.num_worker_threads() as usize;
        assert!(count >= min, "Got {:?} worker items, need at least {:?}", count, min);

        let items = items
            .into_iter()
            .map(|item| CachePadded::new(Mutex::new(item)))
            .collect();

        WorkerData {
            items: Arc::new(items),
            scheduler: scheduler.id(),
        }
    }
}

impl<T> WorkerData<T> {
    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// The scheduler these items were created for.
    pub fn scheduler_id(&self) -> SchedulerId { self.scheduler }

    /// Access the item of a worker.
    #[inline]
    pub fn with<R>(&self, worker: WorkerId, f: impl FnOnce(&mut T) -> R) -> R {
        let mut item = self.items[worker.index()].lock().unwrap();
        f(&mut item)
    }

    /// Visit all items, only if this is the only remaining reference to them.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(WorkerId, &mut T)) -> bool {
        let items = match Arc::get_mut(&mut self.items) {
            Some(items) => items,
            None => return false,
        };

        for (idx, item) in items.iter_mut().enumerate() {
            f(WorkerId(idx as u32), item.get_mut().unwrap());
        }

        true
    }

    /// Take the items back, if this is the only remaining reference to them.
    pub fn into_vec(self) -> Result<Vec<T>, Self> {
        let scheduler = self.scheduler;
        match Arc::try_unwrap(self.items) {
            Ok(items) => Ok(items
                .into_iter()
                .map(|item| CachePadded::into_inner(item).into_inner().unwrap())
                .collect()),
            Err(items) => Err(WorkerData { items, scheduler }),
        }
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.items)
    }
}

#[test]
fn test_worker_data() {
    use crate::JobFlags;

    let scheduler = Scheduler::builder().with_worker_threads(3).build().unwrap();

    let mut counters = WorkerData::new(&scheduler, |_| 0u32);
    assert_eq!(counters.len(), 3);

    let handles: Vec<_> = (0..300).map(|_| {
        let counters = counters.clone();
        scheduler.submit(move |worker| {
            counters.with(worker, |count| *count += 1);
        }, JobFlags::NONE).unwrap()
    }).collect();

    for handle in &handles {
        handle.wait().unwrap();
    }

    // Job bodies are dropped before their completion is published.
    assert_eq!(counters.strong_count(), 1);

    let mut visited = 0;
    assert!(counters.for_each_mut(|worker, count| {
        assert!(worker.index() < 3);
        visited += *count;
    }));
    assert_eq!(visited, 300);

    let items = counters.into_vec().ok().unwrap();
    assert_eq!(items.iter().sum::<u32>(), 300);

    scheduler.shutdown().wait();
}

#[test]
#[should_panic]
fn test_not_enough_items() {
    let scheduler = Scheduler::builder().with_worker_threads(2).build().unwrap();
    let _data = WorkerData::from_vec(vec![0u8], &scheduler);
}
