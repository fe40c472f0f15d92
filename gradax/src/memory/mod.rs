mod pinned;

pub use pinned::{PinnedBuf, PinnedBufferPool};
