// SPDX-License-Identifier: GPL-2.0
//
// Data plane primitives shared by the duoq scheduler family: fixed-capacity
// atomic bitmaps allocated from a pool, an exclusive-access CPU mask, a
// bounded pid/vtime priority queue (ATQ), an idle CPU min-heap, a spin lock
// and the four level topology model.

pub mod atq;
pub mod bitmap;
pub mod cpumask;
pub mod lock;
pub mod minheap;
pub mod topology;

pub use atq::Atq;
pub use atq::AtqEntry;
pub use bitmap::BitmapPool;
pub use bitmap::ScxBitmap;
pub use cpumask::Cpumask;
pub use lock::SpinLock;
pub use minheap::MinHeap;
pub use topology::CoreType;
pub use topology::TopoCpu;
pub use topology::Topology;

lazy_static::lazy_static! {
    /// Number of possible CPU ids on the running system.
    pub static ref NR_CPU_IDS: usize =
        unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF).max(1) as usize };
}

/// Errors produced by the fixed-capacity data plane types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An index was outside the configured capacity.
    InvalidArg,
    /// A fixed pool or bounded container was exhausted.
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArg => write!(f, "index out of range"),
            Error::OutOfMemory => write!(f, "pool exhausted"),
        }
    }
}

impl std::error::Error for Error {}
