use crate::backend::acl_backend::DeviceIndex;
use crate::error::ForgeResult;
use crate::stream::{NpuStream, StreamPool};

/// Makes a stream current (and its device active) for the guard's lifetime.
///
/// On drop the previous current stream of that device and the previously
/// active device are restored.
#[derive(Debug)]
pub struct StreamGuard<'a> {
    pool: &'a StreamPool,
    original_device: DeviceIndex,
    original_stream: NpuStream,
    current_stream: NpuStream,
}

impl<'a> StreamGuard<'a> {
    pub fn new(pool: &'a StreamPool, stream: &NpuStream) -> ForgeResult<Self> {
        let original_device = pool.registry().exchange_device(stream.device_index())?;
        let original_stream = match pool.current_stream(Some(stream.device_index())) {
            Ok(current) => current,
            Err(err) => {
                pool.registry().unchecked_set_device(original_device);
                return Err(err);
            }
        };
        pool.set_current_stream(stream);
        Ok(StreamGuard {
            pool,
            original_device,
            original_stream,
            current_stream: stream.clone(),
        })
    }

    pub fn original_stream(&self) -> &NpuStream {
        &self.original_stream
    }

    pub fn current_stream(&self) -> &NpuStream {
        &self.current_stream
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.pool.set_current_stream(&self.original_stream);
        if self.original_device != self.current_stream.device_index() {
            self.pool.registry().unchecked_set_device(self.original_device);
        }
    }
}
