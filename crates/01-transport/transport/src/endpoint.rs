use smallvec::SmallVec;

use crate::{Span, TransportError, TransportResult};

/// Process index inside a fabric.
pub type Rank = usize;

/// Message matching tag.
pub type Tag = u32;

/// Opaque id of an outstanding request on one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Receive source filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(Rank),
}

impl Source {
    pub fn matches(self, rank: Rank) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(expected) => expected == rank,
        }
    }
}

/// Outcome of a completed request.
///
/// For receives `peer` is the sender and `len` the bytes delivered; for sends
/// `peer` is the destination and `len` the bytes sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub peer: Rank,
    pub tag: Tag,
    pub len: usize,
}

/// One completion reported by [`Transport::test_some`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Index into the request slice passed to `test_some`.
    pub index: usize,
    pub status: Status,
}

/// Completion batch returned by a single poll.
pub type Completions = SmallVec<[Completion; 8]>;

/// Point-to-point, tag-matched, non-blocking message transport.
///
/// One endpoint per rank. All methods take `&mut self`: an endpoint is driven
/// by a single thread at a time.
pub trait Transport: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Largest tag the transport accepts, if it advertises one.
    fn tag_upper_bound(&self) -> Option<Tag>;

    /// Posts a non-blocking send of `data`.
    fn isend(&mut self, data: &[u8], dest: Rank, tag: Tag) -> TransportResult<RequestId>;

    /// Posts a non-blocking receive into `target`.
    fn irecv(&mut self, target: Span, source: Source, tag: Tag) -> TransportResult<RequestId>;

    /// Creates an inactive persistent receive; arm it with [`Transport::start`].
    fn recv_init(&mut self, target: Span, source: Source, tag: Tag) -> TransportResult<RequestId>;

    /// Activates an inactive persistent request.
    fn start(&mut self, request: RequestId) -> TransportResult<()>;

    /// Tests every `Some` entry of `requests` without blocking.
    ///
    /// Completed one-shot requests are freed and their entry set to `None`.
    /// Completed persistent requests stay in place, inactive until restarted.
    /// Inactive and `None` entries are skipped. Completions are reported in
    /// ascending index order.
    fn test_some(&mut self, requests: &mut [Option<RequestId>]) -> TransportResult<Completions>;

    /// Cancels and frees a request, active or not.
    fn cancel(&mut self, request: RequestId) -> TransportResult<()>;

    /// Sends `data` and returns once the transport owns it.
    fn send(&mut self, data: &[u8], dest: Rank, tag: Tag) -> TransportResult<()>;

    /// Blocks until every rank has entered the barrier.
    fn barrier(&mut self) -> TransportResult<()>;

    /// Appends `input` to `output` at `position`, advancing it.
    fn pack(&self, input: &[u8], output: &mut [u8], position: &mut usize) -> TransportResult<()> {
        let available = output.len().saturating_sub(*position);
        if input.len() > available {
            return Err(TransportError::PackOverflow {
                needed: input.len(),
                available,
            });
        }
        output[*position..*position + input.len()].copy_from_slice(input);
        *position += input.len();
        Ok(())
    }

    /// Reads `output.len()` bytes from `input` at `position`, advancing it.
    fn unpack(&self, input: &[u8], position: &mut usize, output: &mut [u8]) -> TransportResult<()> {
        let available = input.len().saturating_sub(*position);
        if output.len() > available {
            return Err(TransportError::PackOverflow {
                needed: output.len(),
                available,
            });
        }
        output.copy_from_slice(&input[*position..*position + output.len()]);
        *position += output.len();
        Ok(())
    }
}
