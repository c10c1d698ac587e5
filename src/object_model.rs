//! The type-descriptor contract between the collector and the embedding
//! runtime. The collector never inspects object memory itself; given an
//! object pointer it asks the runtime for the object's size and for the
//! locations of its outgoing pointers.

use crate::util::Address;

/// The outgoing-pointer layout of one object.
pub enum ObjectLayout<'a> {
    /// Pointer field offsets, in bytes from the object start.
    Fields(&'a [usize]),
    /// A contiguous run of pointer-sized elements, each a potential
    /// reference: `length` elements of `stride` bytes starting at
    /// `offset` bytes from the object start.
    Array {
        offset: usize,
        stride: usize,
        length: usize,
    },
}

impl ObjectLayout<'_> {
    pub fn is_array(&self) -> bool {
        matches!(self, ObjectLayout::Array { .. })
    }
}

/// Runtime type information for heap objects.
///
/// Implementations must answer for any object the collector has allocated
/// and not yet freed, including objects that are no longer reachable: the
/// sweeper reads the size of dead objects before reclaiming them.
pub trait ObjectModel: Send + Sync + 'static {
    /// The size of the object in bytes, including its header. Does not need
    /// to be aligned; the collector aligns it to the allocation granule.
    fn size(&self, object: Address) -> usize;

    /// The outgoing-pointer layout of the object. Returned slices borrow
    /// from the model (typically from a per-type descriptor table).
    fn layout(&self, object: Address) -> ObjectLayout<'_>;
}
