//! GPU-visible light arrays whose length is compiled into the program

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::backend::{BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend};

/// Dense array of light records sized for one compiled program variant.
///
/// The buffer always holds at least one record so that a zero-light variant
/// still has something to bind.
#[derive(Debug)]
pub struct LightBlock<T: Pod> {
    label: &'static str,
    usage: BufferUsage,
    buffer: Option<BufferHandle>,
    count: Option<usize>,
    _marker: PhantomData<T>,
}

impl<T: Pod> LightBlock<T> {
    pub fn new(label: &'static str, usage: BufferUsage) -> Self {
        Self {
            label,
            usage,
            buffer: None,
            count: None,
            _marker: PhantomData,
        }
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Number of records the current layout was built for
    pub fn count(&self) -> Option<usize> {
        self.count
    }

    /// Drop the old buffer and allocate one for `count` records
    pub fn allocate(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        count: usize,
    ) -> BackendResult<BufferHandle> {
        if let Some(old) = self.buffer.take() {
            backend.destroy_buffer(old);
        }
        self.count = None;
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: Some(self.label.to_string()),
            size: (count.max(1) * std::mem::size_of::<T>()) as u64,
            usage: self.usage | BufferUsage::COPY_DST,
        })?;
        self.buffer = Some(buffer);
        self.count = Some(count);
        Ok(buffer)
    }

    /// Write `data` into the block. Data that does not match the allocated
    /// layout is rejected and the previous contents are kept.
    pub fn upload(&mut self, backend: &mut dyn GraphicsBackend, data: &[T]) -> bool {
        let (Some(buffer), Some(count)) = (self.buffer, self.count) else {
            log::warn!("{}: upload before allocation", self.label);
            return false;
        };
        if data.len() != count {
            log::warn!(
                "{}: Invalid data length {} (block holds {})",
                self.label,
                data.len(),
                count
            );
            return false;
        }
        if !data.is_empty() {
            backend.write_buffer(buffer, 0, bytemuck::cast_slice(data));
        }
        true
    }

    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy_buffer(buffer);
        }
        self.count = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::scene::DirectionalLightData;

    #[test]
    fn test_upload_checks_length() {
        let mut backend = SoftwareBackend::new(1, 1);
        let mut block = LightBlock::<DirectionalLightData>::new("Lights", BufferUsage::UNIFORM);
        assert!(!block.upload(&mut backend, &[]));

        block.allocate(&mut backend, 2).unwrap();
        let record = DirectionalLightData {
            direction: [0.0, -1.0, 0.0, 0.0],
            color: [1.0; 4],
        };
        assert!(!block.upload(&mut backend, &[record]));
        assert_eq!(backend.stats().buffer_writes, 0);

        assert!(block.upload(&mut backend, &[record, record]));
        assert_eq!(backend.stats().buffer_writes, 1);
    }

    #[test]
    fn test_empty_block_still_allocates() {
        let mut backend = SoftwareBackend::new(1, 1);
        let mut block = LightBlock::<DirectionalLightData>::new("Lights", BufferUsage::UNIFORM);
        block.allocate(&mut backend, 0).unwrap();
        assert!(block.buffer().is_some());
        assert_eq!(block.count(), Some(0));
        assert!(block.upload(&mut backend, &[]));
        assert_eq!(backend.stats().buffer_writes, 0);
    }
}
