/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::sync::{
    Mutex, Condvar,
    atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, AtomicBool, AtomicPtr},
};


#[cfg(loom)] pub use loom::sync::{
    Mutex, Condvar,
    atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, AtomicBool, AtomicPtr},
};
