//! Out-of-line heap metadata: the per-granule object bytemap, per-block
//! state records, and per-line marks. All three tables are parallel arrays
//! indexed by position in the heap range, mapped at heap init for the
//! maximum heap size and extended implicitly as the heap grows.

pub mod block;
pub mod bytemap;
pub mod line;

pub use self::block::{Block, BlockFlag, BlockMeta, BlockMetaTable};
pub use self::bytemap::{Bytemap, ObjectState};
pub use self::line::{FreeLineMeta, Line, LineMetaTable};
