//! NPU streams: pooled command queues and per-thread current stream

mod guard;
mod npu_stream;
mod pool;

pub use guard::StreamGuard;
pub use npu_stream::{NpuStream, StreamClass, StreamData3, StreamId, StreamKind};
pub use pool::{StreamPool, STREAMS_PER_POOL};
