use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use derive_more::{Deref, Display};

use super::{
    layout::{LayoutError, TensorDesc},
    num::Scalar,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct BufferId(uid::Id<BufferId>);

/// A raw, shared byte buffer. Clones refer to the same storage.
#[derive(Debug, Clone)]
pub struct Buffer {
    id: BufferId,
    data: Arc<RwLock<Box<[u8]>>>,
}

impl Buffer {
    #[inline]
    pub fn zeroed(size: usize) -> Self {
        Self::from_bytes(vec![0u8; size].into_boxed_slice())
    }

    #[inline]
    pub fn from_bytes(bytes: Box<[u8]>) -> Self {
        let id = BufferId(uid::Id::new());
        let data = Arc::new(RwLock::new(bytes));
        Self { id, data }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().expect("failed to lock")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().expect("failed to lock")
    }

    /// Copies the contents out as typed elements.
    #[inline]
    pub fn read_slice<T: Scalar>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec::<u8, T>(&self.read())
    }

    /// Overwrites the head of the buffer with typed elements.
    #[inline]
    pub fn write_slice<T: Scalar>(&self, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.write()[..bytes.len()].copy_from_slice(bytes);
    }

    /// Whether both handles point at the same storage.
    #[inline]
    pub fn same_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// A buffer together with the descriptor it is viewed through.
#[derive(Debug, Clone)]
pub struct Memory {
    buffer: Buffer,
    desc: TensorDesc,
}

impl Memory {
    /// Allocates a zeroed buffer sized exactly for a concrete descriptor.
    pub fn alloc(desc: TensorDesc) -> Result<Self, LayoutError> {
        let size = desc.size_in_bytes()?;
        let buffer = Buffer::zeroed(size);
        Ok(Self { buffer, desc })
    }

    /// Wraps an existing buffer, which must be large enough for `desc`.
    pub fn from_buffer(buffer: Buffer, desc: TensorDesc) -> Result<Self, LayoutError> {
        let size = desc.size_in_bytes()?;
        let len = buffer.len();
        if size > len {
            return Err(LayoutError::Size(len, desc));
        }
        Ok(Self { buffer, desc })
    }

    /// Views the same storage through another descriptor.
    #[inline]
    pub fn view(&self, desc: TensorDesc) -> Result<Self, LayoutError> {
        Self::from_buffer(self.buffer.clone(), desc)
    }

    #[inline]
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Memory;
    use crate::loom::{layout::TensorDesc, num::DataType};

    #[test]
    fn test_view_shares_storage() -> Result<(), Box<dyn Error>> {
        let memory = Memory::alloc(TensorDesc::planar(DataType::F32, [2, 6]))?;
        memory.buffer().write_slice(&[1.0f32, 2.0, 3.0]);

        let view = memory.view(TensorDesc::planar(DataType::F32, [3, 4]))?;
        assert!(view.buffer().same_storage(memory.buffer()));
        assert_eq!(&view.buffer().read_slice::<f32>()[..3], &[1.0, 2.0, 3.0]);

        assert!(memory.view(TensorDesc::planar(DataType::F32, [4, 4])).is_err());
        assert!(Memory::alloc(TensorDesc::any(DataType::F32, [2])).is_err());
        Ok(())
    }
}
