use hashbrown::HashMap;

use crate::buffer::TraceBuffer;
use crate::record::{
    xor_into, AddressBytes, DeviceId, Fragment, FrameHeader, PacketHeader, PathId, Payload,
    FRAME_HEADER_SIZE,
};
use crate::{Level, TraceError};

/// A frame in the log, borrowed from its [`TraceBuffer`].
#[derive(Debug, Copy, Clone)]
pub struct FrameRef<'b> {
    buffer: &'b TraceBuffer,
    offset: usize,
    header: FrameHeader,
    end: usize,
}

impl<'b> FrameRef<'b> {
    pub(crate) fn at(buffer: &'b TraceBuffer, offset: usize) -> Result<Self, TraceError> {
        let header = buffer.frame_header(offset)?;
        let end = buffer.next(offset, Level::Frame)?;
        Ok(Self {
            buffer,
            offset,
            header,
            end,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn header(&self) -> FrameHeader {
        self.header
    }

    /// Position of the next frame header, or the end of the log for the last frame.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Returns `true` if the frame holds no packets.
    pub fn is_empty(&self) -> bool {
        self.offset + FRAME_HEADER_SIZE >= self.end
    }

    pub fn packets(&self) -> Packets<'b> {
        Packets {
            span: Span::new(
                self.buffer,
                self.offset + FRAME_HEADER_SIZE,
                self.end,
                Level::Packet,
            ),
        }
    }
}

/// A packet header together with the position of its payloads.
#[derive(Debug, Copy, Clone)]
pub struct PacketRef<'b> {
    buffer: &'b TraceBuffer,
    offset: usize,
    header: PacketHeader,
    body: usize,
    end: usize,
}

impl<'b> PacketRef<'b> {
    /// Decodes the packet whose header is at `offset`.
    pub fn at(buffer: &'b TraceBuffer, offset: usize) -> Result<Self, TraceError> {
        let (fragment, size) = buffer.decode_at(offset)?;
        let Fragment::Packet(header) = fragment else {
            return Err(TraceError::UnexpectedFragment {
                offset,
                expected: Level::Packet,
            });
        };
        let end = buffer.next(offset, Level::Packet)?;
        Ok(Self {
            buffer,
            offset,
            header,
            body: offset + size,
            end,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn device(&self) -> DeviceId {
        self.header.device()
    }

    pub fn path(&self) -> Option<PathId> {
        self.header.path()
    }

    pub fn address(&self) -> Option<&AddressBytes> {
        self.header.address()
    }

    /// Position one past the last payload of this packet.
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn payloads(&self) -> Payloads<'b> {
        Payloads {
            span: Span::new(self.buffer, self.body, self.end, Level::Payload),
        }
    }

    /// Number of data bytes this packet describes.
    ///
    /// A pure read carries no payload, its declared length only counts with `include_reads`.
    pub fn payload_len(&self, include_reads: bool) -> Result<u64, TraceError> {
        match &self.header {
            PacketHeader::Clear(_) => Ok(0),
            PacketHeader::PureRead(read) if include_reads => Ok(read.payload_len()),
            PacketHeader::PureRead(_) => Ok(0),
            _ => self
                .payloads()
                .try_fold(0u64, |len, payload| Ok(len + payload?.len() as u64)),
        }
    }

    /// Concatenates the payload fragments of this packet.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, TraceError> {
        let mut bytes = Vec::new();
        for payload in self.payloads() {
            bytes.extend_from_slice(payload?.bytes());
        }
        Ok(bytes)
    }

    /// XORs the payload into `value`. For a write this turns the old value into the new one and
    /// back again.
    pub fn xor_into(&self, value: &mut [u8]) -> Result<(), TraceError> {
        let mut consumed = 0;
        for payload in self.payloads() {
            let payload = payload?;
            if consumed >= value.len() {
                break;
            }
            xor_into(&mut value[consumed..], payload.bytes());
            consumed += payload.len();
        }
        Ok(())
    }
}

/// A payload fragment and its position in the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PayloadRef {
    offset: usize,
    payload: Payload,
}

impl PayloadRef {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn bytes(&self) -> &[u8] {
        self.payload.bytes()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn continues(&self) -> bool {
        self.payload.continues()
    }
}

/// Iterator over every frame of a [`TraceBuffer`].
///
/// Yields an error at most once, then stops.
#[derive(Debug, Clone)]
pub struct Frames<'b> {
    buffer: &'b TraceBuffer,
    front: usize,
    back: usize,
    failed: bool,
}

impl<'b> Frames<'b> {
    pub(crate) fn new(buffer: &'b TraceBuffer) -> Self {
        Self {
            buffer,
            front: buffer.begin(),
            back: buffer.end(),
            failed: false,
        }
    }

    fn fail<T>(&mut self, error: TraceError) -> Option<Result<T, TraceError>> {
        self.failed = true;
        Some(Err(error))
    }
}

impl<'b> Iterator for Frames<'b> {
    type Item = Result<FrameRef<'b>, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.front >= self.back {
            return None;
        }
        match FrameRef::at(self.buffer, self.front) {
            Ok(frame) => {
                self.front = frame.end;
                Some(Ok(frame))
            }
            Err(e) => self.fail(e),
        }
    }
}

impl<'b> DoubleEndedIterator for Frames<'b> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.failed || self.front >= self.back {
            return None;
        }
        match self.buffer.prev(self.back, Level::Frame) {
            Ok(Some(pos)) if pos >= self.front => match FrameRef::at(self.buffer, pos) {
                Ok(frame) => {
                    self.back = pos;
                    Some(Ok(frame))
                }
                Err(e) => self.fail(e),
            },
            Ok(_) => {
                self.back = self.front;
                None
            }
            Err(e) => self.fail(e),
        }
    }
}

/// Walks the fragments of one level between two positions.
#[derive(Debug, Clone)]
struct Span<'b> {
    buffer: &'b TraceBuffer,
    front: usize,
    back: usize,
    level: Level,
    backlinks: Option<Vec<usize>>,
    failed: bool,
}

impl<'b> Span<'b> {
    fn new(buffer: &'b TraceBuffer, front: usize, back: usize, level: Level) -> Self {
        Self {
            buffer,
            front,
            back,
            level,
            backlinks: None,
            failed: false,
        }
    }

    fn next(&mut self) -> Option<Result<usize, TraceError>> {
        if self.failed || self.front >= self.back {
            return None;
        }
        let pos = self.front;
        let result = self.buffer.decode_at(pos).and_then(|(fragment, size)| {
            if fragment.level() != self.level {
                return Err(TraceError::UnexpectedFragment {
                    offset: pos,
                    expected: self.level,
                });
            }
            match self.level {
                Level::Payload => Ok(pos + size),
                level => self.buffer.next(pos, level),
            }
        });
        match result {
            Ok(next) => {
                self.front = next;
                Some(Ok(pos))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn next_back(&mut self) -> Option<Result<usize, TraceError>> {
        if self.failed || self.front >= self.back {
            return None;
        }
        if self.backlinks.is_none() {
            match self.buffer.positions(self.front, self.back, self.level) {
                Ok(positions) => self.backlinks = Some(positions),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        let positions = self.backlinks.as_mut()?;
        match positions.pop() {
            Some(pos) if pos >= self.front => {
                self.back = pos;
                Some(Ok(pos))
            }
            _ => {
                self.back = self.front;
                None
            }
        }
    }
}

/// Iterator over the packets of a frame.
#[derive(Debug, Clone)]
pub struct Packets<'b> {
    span: Span<'b>,
}

impl<'b> Packets<'b> {
    fn resolve(&mut self, pos: Result<usize, TraceError>) -> Result<PacketRef<'b>, TraceError> {
        let packet = pos.and_then(|pos| PacketRef::at(self.span.buffer, pos));
        if packet.is_err() {
            self.span.failed = true;
        }
        packet
    }
}

impl<'b> Iterator for Packets<'b> {
    type Item = Result<PacketRef<'b>, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.span.next()?;
        Some(self.resolve(pos))
    }
}

impl<'b> DoubleEndedIterator for Packets<'b> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let pos = self.span.next_back()?;
        Some(self.resolve(pos))
    }
}

/// Iterator over the payload fragments of a packet.
#[derive(Debug, Clone)]
pub struct Payloads<'b> {
    span: Span<'b>,
}

impl<'b> Payloads<'b> {
    fn resolve(&mut self, pos: Result<usize, TraceError>) -> Result<PayloadRef, TraceError> {
        let payload = pos.and_then(|pos| match self.span.buffer.fragment(pos)? {
            Fragment::Payload(payload) => Ok(PayloadRef {
                offset: pos,
                payload,
            }),
            _ => Err(TraceError::UnexpectedFragment {
                offset: pos,
                expected: Level::Payload,
            }),
        });
        if payload.is_err() {
            self.span.failed = true;
        }
        payload
    }
}

impl<'b> Iterator for Payloads<'b> {
    type Item = Result<PayloadRef, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.span.next()?;
        Some(self.resolve(pos))
    }
}

impl<'b> DoubleEndedIterator for Payloads<'b> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let pos = self.span.next_back()?;
        Some(self.resolve(pos))
    }
}

/// Memoizes [`TraceBuffer::prev`] for callers that step backward repeatedly.
///
/// The cache remembers the generation of the buffer it was filled from and forgets everything
/// once the buffer has been cleared. Entries for the open frame are never stored, since that
/// frame can still grow.
#[derive(Debug, Default, Clone)]
pub struct BacklinkCache {
    generation: u64,
    links: HashMap<(usize, Level), Option<usize>>,
}

impl BacklinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn clear(&mut self) {
        self.links.clear();
    }

    pub fn prev(
        &mut self,
        buffer: &TraceBuffer,
        loc: usize,
        level: Level,
    ) -> Result<Option<usize>, TraceError> {
        if self.generation != buffer.generation() {
            self.links.clear();
            self.generation = buffer.generation();
        }
        if let Some(link) = self.links.get(&(loc, level)) {
            return Ok(*link);
        }
        let link = buffer.prev(loc, level)?;
        if loc <= buffer.last_frame_start() {
            self.links.insert((loc, level), link);
        }
        Ok(link)
    }
}
