//! Memory handle pool.
//!
//! Registered regions live in an engine-local table. Callers and peers only
//! ever see a [`MemHandle`], whose token indexes that table; a generation
//! counter in the token keeps a stale handle from resolving to a recycled
//! entry.

use transport::{Datatype, MemRegion, Span, TransportError, TransportResult};

/// Engine-local key of a registration: `(generation << 32) | index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleToken(pub u64);

impl HandleToken {
    fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    fn index(self) -> usize {
        (self.0 & u32::MAX as u64) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Value handed out by registration and shipped to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemHandle {
    pub token: HandleToken,
    pub datatype: Datatype,
    pub count: u64,
}

impl MemHandle {
    /// Encoded size of a handle on the wire.
    pub const WIRE_LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let (code, width) = self.datatype.code();
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..8].copy_from_slice(&self.token.0.to_le_bytes());
        out[8..16].copy_from_slice(&self.count.to_le_bytes());
        out[16..20].copy_from_slice(&code.to_le_bytes());
        out[20..24].copy_from_slice(&width.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::WIRE_LEN)?;
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        Some(Self {
            token: HandleToken(u64_at(0)),
            count: u64_at(8),
            datatype: Datatype::from_code(u32_at(16), u32_at(20))?,
        })
    }
}

/// What a token resolves to on the owning engine.
#[derive(Clone, Debug)]
pub struct MemRegistration {
    pub region: MemRegion,
    pub datatype: Datatype,
    pub count: usize,
}

impl MemRegistration {
    /// Byte range `offset..offset + len` of the region.
    pub fn span(&self, offset: usize, len: usize) -> TransportResult<Span> {
        self.region.span(offset, len)
    }

    /// The registered extent, `count` elements from the start of the region.
    pub fn extent_span(&self) -> TransportResult<Span> {
        let len = self
            .datatype
            .extent(self.count)
            .ok_or(TransportError::OutOfBounds {
                offset: 0,
                len: usize::MAX,
                region_len: self.region.len(),
            })?;
        self.region.span(0, len)
    }
}

struct PoolEntry {
    generation: u32,
    registration: Option<MemRegistration>,
}

#[derive(Default)]
pub(crate) struct HandlePool {
    entries: Vec<PoolEntry>,
    free: Vec<u32>,
    live: usize,
}

impl HandlePool {
    pub(crate) fn register(&mut self, registration: MemRegistration) -> MemHandle {
        let handle_for = |token, registration: &MemRegistration| MemHandle {
            token,
            datatype: registration.datatype,
            count: registration.count as u64,
        };

        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.generation = entry.generation.wrapping_add(1).max(1);
            let token = HandleToken::new(index, entry.generation);
            let handle = handle_for(token, &registration);
            entry.registration = Some(registration);
            return handle;
        }

        let index = self.entries.len() as u32;
        let token = HandleToken::new(index, 1);
        let handle = handle_for(token, &registration);
        self.entries.push(PoolEntry {
            generation: 1,
            registration: Some(registration),
        });
        handle
    }

    pub(crate) fn unregister(&mut self, token: HandleToken) -> Option<MemRegistration> {
        let entry = self.entries.get_mut(token.index())?;
        if entry.generation != token.generation() {
            return None;
        }
        let registration = entry.registration.take()?;
        self.free.push(token.index() as u32);
        self.live -= 1;
        Some(registration)
    }

    pub(crate) fn get(&self, token: HandleToken) -> Option<&MemRegistration> {
        let entry = self.entries.get(token.index())?;
        if entry.generation != token.generation() {
            return None;
        }
        entry.registration.as_ref()
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }
}
