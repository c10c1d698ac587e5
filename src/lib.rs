//! A concurrent, parallel, mark-region garbage collector.
//!
//! The heap is a flat range of fixed-size blocks subdivided into lines.
//! Liveness is tracked out of line in per-word, per-line and per-block
//! bytemaps, and memory is reclaimed by a phased mark -> sweep -> coalesce
//! protocol executed cooperatively by the allocating thread and a pool of
//! GC worker threads. The collector never moves objects; the heap grows
//! monotonically by appending blocks to a reserved address range.
//!
//! The embedding runtime supplies two collaborators: an [`ObjectModel`]
//! that yields an object's size and outgoing pointer layout, and one or
//! more [`RootProvider`]s that enumerate root pointers. Everything else
//! (allocation, tracing, sweeping, heap growth) lives in this crate.
//!
//! [`ObjectModel`]: crate::object_model::ObjectModel
//! [`RootProvider`]: crate::roots::RootProvider

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

mod alloc;
mod gc;
mod heap;
mod marker;
mod metadata;
pub mod object_model;
pub mod roots;
mod stats;
mod sweeper;
pub mod util;

pub use crate::gc::{Gc, Mutator};
pub use crate::heap::phase::Phase;
pub use crate::heap::Heap;
pub use crate::metadata::{BlockFlag, ObjectState};
pub use crate::util::address::Address;
pub use crate::util::options::Options;
