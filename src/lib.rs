//! A job scheduler for fan-in heavy workloads such as staged decode and render pipelines.
//!
//! What we want:
//! - A fixed pool of worker threads sharing a single ready queue.
//! - Jobs that can be configured before being submitted, and handles to wait for them.
//! - Barriers that release follow-on jobs exactly once, when all of their predecessors are
//!   done, without the scheduler knowing anything about the shape of the graph.
//! - Job records recycled through a concurrent append-only arena, so that a steady load
//!   doesn't allocate.
//! - Avoid hoarding CPU resources in worker threads that don't have work to execute (this
//!   is at the cost of higher latency).
//! - No implicit global scheduler.
//!
//! ```no_run
//! use stagehand::{Scheduler, JobFlags};
//!
//! let scheduler = Scheduler::builder().with_worker_threads(4).build().unwrap();
//!
//! let barrier = scheduler.barrier(2);
//! let done = scheduler.job(|_| println!("both inputs are ready")).after(&barrier).unwrap();
//! scheduler.job(|_| println!("input A")).signal(&barrier).submit().unwrap();
//! scheduler.job(|_| println!("input B")).signal(&barrier).submit().unwrap();
//! done.wait().unwrap();
//!
//! let report = |worker: stagehand::WorkerId| println!("on worker {}", worker.index());
//! scheduler.submit_and_wait(report, JobFlags::NONE).unwrap();
//!
//! scheduler.shutdown().wait();
//! ```

mod core;
mod error;
mod pipeline;
pub mod arena;
pub mod handle;
pub mod helpers;

pub use crate::core::job::{JobFlags, JobId, WorkerId};
pub use crate::core::barrier::Barrier;
pub use crate::core::scheduler::{Scheduler, SchedulerBuilder, SchedulerId};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::WorkerHook;
pub use crate::core::sync;
pub use arena::Arena;
pub use error::{Error, Result};
pub use handle::{JobBuilder, JobHandle, PreparedJob};
pub use helpers::WorkerData;
pub use pipeline::{Pipeline, PipelineHandle};

pub use crossbeam_utils::CachePadded;
