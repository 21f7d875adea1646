//! Shared byte regions and the spans that address them.
//!
//! A [`MemRegion`] is the unit of memory the engine registers and the fabric
//! reads from or writes into. Cloning a region clones the handle, not the
//! bytes, so an in-flight receive keeps its target alive even if the owner
//! drops its copy.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{TransportError, TransportResult};

/// Shared, fixed-length byte buffer.
#[derive(Clone, Default)]
pub struct MemRegion {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemRegion {
    /// Allocates a zeroed region of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles refer to the same backing buffer.
    pub fn ptr_eq(&self, other: &MemRegion) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    /// Builds a bounds-checked view of `offset..offset + len`.
    pub fn span(&self, offset: usize, len: usize) -> TransportResult<Span> {
        check_range(offset, len, self.len())?;
        Ok(Span {
            region: self.clone(),
            offset,
            len,
        })
    }

    /// View over the whole region.
    pub fn full_span(&self) -> Span {
        Span {
            region: self.clone(),
            offset: 0,
            len: self.len(),
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> TransportResult<Vec<u8>> {
        let bytes = self.bytes.lock();
        check_range(offset, len, bytes.len())?;
        Ok(bytes[offset..offset + len].to_vec())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> TransportResult<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl std::fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRegion")
            .field("len", &self.len())
            .finish()
    }
}

/// A byte range inside a [`MemRegion`].
#[derive(Clone, Debug)]
pub struct Span {
    region: MemRegion,
    offset: usize,
    len: usize,
}

impl Span {
    pub fn region(&self) -> &MemRegion {
        &self.region
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the covered bytes out.
    pub fn read(&self) -> TransportResult<Vec<u8>> {
        self.region.read(self.offset, self.len)
    }

    /// Writes `data` at the start of the span, returning the bytes written.
    ///
    /// Fails with [`TransportError::Truncated`] when `data` is longer than the
    /// span; nothing is written in that case.
    pub fn fill_from(&self, data: &[u8]) -> TransportResult<usize> {
        if data.len() > self.len {
            return Err(TransportError::Truncated {
                capacity: self.len,
                received: data.len(),
            });
        }
        self.region.write(self.offset, data)?;
        Ok(data.len())
    }
}

fn check_range(offset: usize, len: usize, region_len: usize) -> TransportResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= region_len => Ok(()),
        _ => Err(TransportError::OutOfBounds {
            offset,
            len,
            region_len,
        }),
    }
}
