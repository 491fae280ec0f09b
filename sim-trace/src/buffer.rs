use std::fmt;
use std::ops::{Deref, DerefMut};

use hashbrown::HashSet;
use num_traits::{PrimInt, Unsigned};
use tracing::{debug, trace};

use crate::iter::Frames;
use crate::record::{
    AddressBytes, Clear, DeviceId, Fragment, FrameHeader, ImpureRead, Increment, PacketHeader,
    PathId, Payload, PureRead, Write,
};
use crate::sink::SharedSink;
use crate::{Level, TraceError};

/// Handle returned by [`TraceBuffer::register_sink`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(usize);

/// Append-only log of frames, packets and payloads.
///
/// The first fragment of a non-empty log is always a frame header. Every frame header except
/// the first links back to its predecessor, and every frame except the last records its own
/// length, so the log can be walked in both directions.
pub struct TraceBuffer {
    data: Vec<u8>,
    last_frame_start: usize,
    traced: HashSet<DeviceId>,
    paths: Vec<PathId>,
    sinks: Vec<SharedSink>,
    sink_ids: Vec<SinkId>,
    next_sink: usize,
    generation: u64,
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("len", &self.data.len())
            .field("last_frame_start", &self.last_frame_start)
            .field("traced", &self.traced)
            .field("paths", &self.paths)
            .field("sinks", &self.sink_ids)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            last_frame_start: 0,
            traced: HashSet::new(),
            paths: vec![0],
            sinks: Vec::new(),
            sink_ids: Vec::new(),
            next_sink: 0,
            generation: 0,
        }
    }

    /// Returns the encoded log.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Counter bumped by every [`TraceBuffer::clear`]. Positions and caches taken under an older
    /// generation are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Offset of the frame header that is currently being written to.
    pub fn last_frame_start(&self) -> usize {
        self.last_frame_start
    }

    /// Discards the log and the translation path stack. Trace filters and sinks are kept.
    pub fn clear(&mut self) {
        self.data.clear();
        self.last_frame_start = 0;
        self.paths.clear();
        self.paths.push(0);
        self.generation = self.generation.wrapping_add(1);
        debug!(generation = self.generation, "cleared trace buffer");
    }

    /// Enables or disables recording of packets produced by `device`.
    pub fn trace(&mut self, device: DeviceId, enabled: bool) {
        if enabled {
            self.traced.insert(device);
        } else {
            self.traced.remove(&device);
        }
    }

    pub fn traced(&self, device: DeviceId) -> bool {
        self.traced.contains(&device)
    }

    /// Translation path stamped onto packets written now.
    pub fn current_path(&self) -> PathId {
        self.paths.last().copied().unwrap_or(0)
    }

    /// Makes `path` current until the returned guard is dropped.
    pub fn push_path(&mut self, path: PathId) -> PathGuard<'_> {
        let pushed = self.current_path() != path;
        if pushed {
            self.paths.push(path);
        }
        PathGuard {
            buffer: self,
            pushed,
        }
    }

    pub fn register_sink(&mut self, sink: SharedSink) -> SinkId {
        let id = SinkId(self.next_sink);
        self.next_sink += 1;
        self.sinks.push(sink);
        self.sink_ids.push(id);
        id
    }

    /// Removes a sink. Returns `false` if `id` was not registered.
    pub fn unregister_sink(&mut self, id: SinkId) -> bool {
        match self.sink_ids.iter().position(|registered| *registered == id) {
            Some(index) => {
                self.sink_ids.remove(index);
                self.sinks.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn sinks(&self) -> &[SharedSink] {
        &self.sinks
    }

    /// Appends a single fragment.
    ///
    /// A frame header closes the current frame, and its own fields are computed here, so the
    /// values in `fragment` are ignored. Any other fragment written to an empty log opens the
    /// first frame implicitly.
    pub fn write_fragment<F: Into<Fragment>>(&mut self, fragment: F) -> Result<(), TraceError> {
        match fragment.into() {
            Fragment::Frame(_) => self.open_frame(),
            fragment => {
                if self.data.is_empty() {
                    self.open_frame()?;
                }
                self.reserve_span(fragment.encoded_len())?;
                self.append(&fragment);
                Ok(())
            }
        }
    }

    /// Records the current frame's length. Idempotent.
    pub fn update_frame_header(&mut self) {
        if self.data.is_empty() {
            return;
        }
        // Writes never let a frame grow past u16::MAX, a zero length only forces readers to scan.
        let length = u16::try_from(self.data.len() - self.last_frame_start).unwrap_or(0);
        FrameHeader::patch_length(&mut self.data[self.last_frame_start..], length);
    }

    pub fn emit_frame_start(&mut self) -> Result<(), TraceError> {
        self.open_frame()
    }

    /// Records a write of `dest` over `src`. The payload holds their XOR.
    pub fn emit_write<A: PrimInt + Unsigned>(
        &mut self,
        device: DeviceId,
        address: A,
        src: &[u8],
        dest: &[u8],
    ) -> Result<(), TraceError> {
        if !self.traced(device) {
            return Ok(());
        }
        let len = src.len().min(dest.len());
        let mut delta = src[..len].to_vec();
        crate::record::xor_into(&mut delta, &dest[..len]);
        let header = Write::new(device, self.current_path(), AddressBytes::from_address(address));
        self.write_packet(header.into(), &Payload::split(&delta))
    }

    /// Records a write to a memory-mapped port. The payload holds the written bytes as-is.
    pub fn emit_mm_write<A: PrimInt + Unsigned>(
        &mut self,
        device: DeviceId,
        address: A,
        bytes: &[u8],
    ) -> Result<(), TraceError> {
        if !self.traced(device) {
            return Ok(());
        }
        let header = Write::new(device, self.current_path(), AddressBytes::from_address(address));
        self.write_packet(header.into(), &Payload::split(bytes))
    }

    /// Records a side-effect free read of `len` bytes.
    pub fn emit_pure_read<A: PrimInt + Unsigned>(
        &mut self,
        device: DeviceId,
        address: A,
        len: u64,
    ) -> Result<(), TraceError> {
        if !self.traced(device) {
            return Ok(());
        }
        let header = PureRead::new(
            device,
            self.current_path(),
            AddressBytes::from_address(address),
            len,
        );
        self.write_packet(header.into(), &[])
    }

    /// Records a read from a memory-mapped port along with the bytes that were read.
    pub fn emit_mm_read<A: PrimInt + Unsigned>(
        &mut self,
        device: DeviceId,
        address: A,
        bytes: &[u8],
    ) -> Result<(), TraceError> {
        if !self.traced(device) {
            return Ok(());
        }
        let header =
            ImpureRead::new(device, self.current_path(), AddressBytes::from_address(address));
        self.write_packet(header.into(), &Payload::split(bytes))
    }

    /// Records that the value at `address` was incremented by the little-endian `addend`.
    pub fn emit_increment<A: PrimInt + Unsigned>(
        &mut self,
        device: DeviceId,
        address: A,
        addend: &[u8],
    ) -> Result<(), TraceError> {
        if !self.traced(device) {
            return Ok(());
        }
        let header = Increment::new(device, AddressBytes::from_address(address));
        self.write_packet(header.into(), &Payload::split(addend))
    }

    pub fn emit_clear(&mut self, device: DeviceId) -> Result<(), TraceError> {
        if !self.traced(device) {
            return Ok(());
        }
        self.write_packet(Clear::new(device).into(), &[])
    }

    /// Appends a packet header and its payloads. Either all of them fit in the current frame or
    /// nothing is written.
    pub fn write_packet(
        &mut self,
        header: PacketHeader,
        payloads: &[Payload],
    ) -> Result<(), TraceError> {
        if self.data.is_empty() {
            self.open_frame()?;
        }
        let header = Fragment::Packet(header);
        let size = header.encoded_len()
            + payloads
                .iter()
                .map(|payload| Fragment::Payload(*payload).encoded_len())
                .sum::<usize>();
        self.reserve_span(size)?;
        self.append(&header);
        for payload in payloads {
            self.append(&Fragment::Payload(*payload));
        }
        Ok(())
    }

    fn open_frame(&mut self) -> Result<(), TraceError> {
        let back_offset = if self.data.is_empty() {
            0
        } else {
            self.update_frame_header();
            let span = self.data.len() - self.last_frame_start;
            u16::try_from(span).map_err(|_| TraceError::FrameOverflow { span })?
        };
        self.last_frame_start = self.data.len();
        self.append(&Fragment::Frame(FrameHeader::new(0, back_offset)));
        Ok(())
    }

    fn reserve_span(&self, additional: usize) -> Result<(), TraceError> {
        let span = self.data.len() - self.last_frame_start + additional;
        if span > u16::MAX as usize {
            return Err(TraceError::FrameOverflow { span });
        }
        Ok(())
    }

    fn append(&mut self, fragment: &Fragment) {
        let offset = self.data.len();
        fragment.emit(&mut self.data);
        trace!(offset = offset, kind = ?fragment.kind(), size = self.data.len() - offset, "wrote fragment");
    }

    /// First position in the log.
    pub fn begin(&self) -> usize {
        0
    }

    /// Position one past the last fragment.
    pub fn end(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn decode_at(&self, loc: usize) -> Result<(Fragment, usize), TraceError> {
        let bytes = self.data.get(loc..).unwrap_or_default();
        Fragment::parse(bytes).map_err(|source| TraceError::Parse {
            offset: loc,
            source,
        })
    }

    /// Decodes the fragment at `loc`.
    pub fn fragment(&self, loc: usize) -> Result<Fragment, TraceError> {
        self.decode_at(loc).map(|(fragment, _)| fragment)
    }

    /// Returns the granularity of the fragment at `loc`.
    pub fn at(&self, loc: usize) -> Result<Level, TraceError> {
        self.fragment(loc).map(|fragment| fragment.level())
    }

    /// Returns the encoded size of the fragment at `loc`.
    pub fn size_at(&self, loc: usize) -> Result<usize, TraceError> {
        self.decode_at(loc).map(|(_, size)| size)
    }

    /// Decodes the frame header at `loc`.
    pub fn frame_header(&self, loc: usize) -> Result<FrameHeader, TraceError> {
        match self.fragment(loc)? {
            Fragment::Frame(header) => Ok(header),
            _ => Err(TraceError::UnexpectedFragment {
                offset: loc,
                expected: Level::Frame,
            }),
        }
    }

    /// Returns the position of the first fragment after `loc` at or above `level`, or
    /// [`TraceBuffer::end`] if there is none.
    pub fn next(&self, loc: usize, level: Level) -> Result<usize, TraceError> {
        let end = self.end();
        if loc >= end {
            return Ok(end);
        }
        let (fragment, size) = self.decode_at(loc)?;
        if let (Level::Frame, Fragment::Frame(header)) = (level, fragment) {
            // The open frame's length is only advisory until the next frame starts.
            if loc != self.last_frame_start && header.length() > 0 {
                return Ok(loc + header.length() as usize);
            }
        }
        let mut pos = loc + size;
        while pos < end {
            let (fragment, size) = self.decode_at(pos)?;
            if fragment.level() <= level {
                return Ok(pos);
            }
            pos += size;
        }
        Ok(end)
    }

    /// Returns the position of the last fragment before `loc` at or above `level`, or `None` if
    /// `loc` is the beginning of the log.
    pub fn prev(&self, loc: usize, level: Level) -> Result<Option<usize>, TraceError> {
        let end = self.end();
        if loc == 0 || end == 0 {
            return Ok(None);
        }
        if loc >= end {
            return self
                .last_before(self.last_frame_start, end, level)
                .map(Some);
        }
        let frame = self.frame_containing(loc)?;
        if frame < loc {
            return self.last_before(frame, loc, level).map(Some);
        }
        let back_offset = self.frame_header(loc)?.back_offset() as usize;
        if back_offset == 0 {
            return Ok(None);
        }
        let previous = loc
            .checked_sub(back_offset)
            .ok_or(TraceError::BrokenBackLink { offset: loc })?;
        match level {
            Level::Frame => Ok(Some(previous)),
            _ => self.last_before(previous, loc, level).map(Some),
        }
    }

    /// Returns the offset of the frame header enclosing `loc`.
    pub fn frame_containing(&self, loc: usize) -> Result<usize, TraceError> {
        if loc >= self.last_frame_start {
            return Ok(self.last_frame_start);
        }
        // Every frame before the last one is closed, so the next frame header exists and links
        // back to the frame we are looking for.
        let next = self.next(loc, Level::Frame)?;
        if next >= self.end() {
            return Ok(self.last_frame_start);
        }
        let back_offset = self.frame_header(next)?.back_offset() as usize;
        next.checked_sub(back_offset)
            .ok_or(TraceError::BrokenBackLink { offset: next })
    }

    /// Scans `[start, end)` and returns the last fragment at or above `level`. `start` must be a
    /// frame header.
    pub(crate) fn last_before(
        &self,
        start: usize,
        end: usize,
        level: Level,
    ) -> Result<usize, TraceError> {
        let mut found = start;
        let mut pos = start;
        while pos < end {
            let (fragment, size) = self.decode_at(pos)?;
            if fragment.level() <= level {
                found = pos;
            }
            pos += size;
        }
        Ok(found)
    }

    /// Collects the positions of every fragment in `[start, end)` with exactly `level`.
    pub(crate) fn positions(
        &self,
        start: usize,
        end: usize,
        level: Level,
    ) -> Result<Vec<usize>, TraceError> {
        let mut positions = Vec::new();
        let mut pos = start;
        while pos < end {
            let (fragment, size) = self.decode_at(pos)?;
            if fragment.level() == level {
                positions.push(pos);
            }
            pos += size;
        }
        Ok(positions)
    }

    #[cfg(test)]
    pub(crate) fn raw_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Iterates over every frame in the log.
    pub fn frames(&self) -> Frames<'_> {
        Frames::new(self)
    }
}

/// Keeps a translation path current for as long as it is alive.
///
/// Dereferences to the buffer so packets can be emitted through it.
pub struct PathGuard<'a> {
    buffer: &'a mut TraceBuffer,
    pushed: bool,
}

impl Deref for PathGuard<'_> {
    type Target = TraceBuffer;

    fn deref(&self) -> &Self::Target {
        self.buffer
    }
}

impl DerefMut for PathGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // The root path survives a `clear` made through the guard.
        if self.pushed && self.buffer.paths.len() > 1 {
            self.buffer.paths.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traced_buffer() -> TraceBuffer {
        let mut buffer = TraceBuffer::new();
        buffer.trace(1, true);
        buffer
    }

    #[test]
    fn first_packet_opens_a_frame() {
        let mut buffer = traced_buffer();
        buffer.emit_clear(1).unwrap();
        assert_eq!(buffer.at(0).unwrap(), Level::Frame);
        assert_eq!(buffer.frame_header(0).unwrap().back_offset(), 0);
        assert_eq!(buffer.next(0, Level::Packet).unwrap(), 5);
    }

    #[test]
    fn untraced_devices_write_nothing() {
        let mut buffer = traced_buffer();
        buffer.emit_write(2, 0u16, &[0], &[1]).unwrap();
        buffer.emit_pure_read(2, 0u16, 4).unwrap();
        buffer.emit_clear(2).unwrap();
        assert!(buffer.is_empty());

        buffer.trace(1, false);
        buffer.emit_clear(1).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn opening_a_frame_closes_the_previous_one() {
        let mut buffer = traced_buffer();
        buffer.emit_frame_start().unwrap();
        buffer.emit_write(1, 0x10u16, &[0, 0], &[1, 2]).unwrap();
        let length = buffer.len();
        buffer.emit_frame_start().unwrap();

        assert_eq!(buffer.frame_header(0).unwrap().length() as usize, length);
        assert_eq!(buffer.last_frame_start(), length);
        assert_eq!(
            buffer.frame_header(length).unwrap().back_offset() as usize,
            length
        );
        assert_eq!(buffer.next(0, Level::Frame).unwrap(), length);
    }

    #[test]
    fn update_frame_header_is_idempotent() {
        let mut buffer = traced_buffer();
        buffer.emit_mm_write(1, 0u8, &[1, 2, 3]).unwrap();
        buffer.update_frame_header();
        let once = buffer.as_bytes().to_vec();
        buffer.update_frame_header();
        assert_eq!(buffer.as_bytes(), once.as_slice());
        assert_eq!(buffer.frame_header(0).unwrap().length() as usize, buffer.len());
    }

    #[test]
    fn frames_cannot_exceed_u16() {
        let mut buffer = traced_buffer();
        let bytes = vec![0u8; 1024];
        let mut result = Ok(());
        for _ in 0..100 {
            result = buffer.emit_mm_write(1, 0u16, &bytes);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TraceError::FrameOverflow { .. })));
        assert!(buffer.len() <= u16::MAX as usize);

        // Nothing of the rejected packet was written, a new frame accepts it.
        let before = buffer.len();
        buffer.emit_frame_start().unwrap();
        buffer.emit_mm_write(1, 0u16, &bytes).unwrap();
        assert!(buffer.len() > before);
    }

    #[test]
    fn paths_are_scoped() {
        let mut buffer = traced_buffer();
        {
            let mut guard = buffer.push_path(3);
            assert_eq!(guard.current_path(), 3);
            guard.emit_pure_read(1, 0u16, 2).unwrap();
        }
        assert_eq!(buffer.current_path(), 0);
        buffer.emit_pure_read(1, 0u16, 2).unwrap();

        let first = buffer.next(0, Level::Packet).unwrap();
        let second = buffer.next(first, Level::Packet).unwrap();
        let path = |loc| match buffer.fragment(loc).unwrap() {
            Fragment::Packet(packet) => packet.path(),
            _ => None,
        };
        assert_eq!(path(first), Some(3));
        assert_eq!(path(second), Some(0));
    }

    #[test]
    fn clearing_through_a_guard_keeps_the_root_path() {
        let mut buffer = traced_buffer();
        {
            let mut guard = buffer.push_path(3);
            guard.clear();
            assert_eq!(guard.current_path(), 0);
        }
        assert_eq!(buffer.paths, [0]);

        let mut guard = buffer.push_path(5);
        guard.emit_clear(1).unwrap();
        drop(guard);
        assert_eq!(buffer.paths, [0]);
    }

    #[test]
    fn clear_resets_the_log() {
        let mut buffer = traced_buffer();
        buffer.emit_clear(1).unwrap();
        let generation = buffer.generation();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.generation(), generation + 1);
        assert!(buffer.traced(1));
        assert_eq!(buffer.prev(buffer.end(), Level::Frame).unwrap(), None);
    }

    #[test]
    fn prev_walks_every_level() {
        let mut buffer = traced_buffer();
        buffer.emit_frame_start().unwrap();
        buffer.emit_mm_write(1, 0u16, &[1; 40]).unwrap();
        buffer.emit_frame_start().unwrap();
        buffer.emit_clear(1).unwrap();

        let second = buffer.last_frame_start();
        let clear = buffer.next(second, Level::Packet).unwrap();
        assert_eq!(buffer.prev(buffer.end(), Level::Packet).unwrap(), Some(clear));
        assert_eq!(buffer.prev(clear, Level::Packet).unwrap(), Some(second));
        assert_eq!(buffer.prev(second, Level::Frame).unwrap(), Some(0));

        // The last payload of the first frame is the second of two fragments.
        let payload = buffer.prev(second, Level::Payload).unwrap().unwrap();
        assert_eq!(buffer.at(payload).unwrap(), Level::Payload);
        assert_eq!(buffer.prev(second, Level::Packet).unwrap(), Some(5));
        assert_eq!(buffer.frame_containing(payload).unwrap(), 0);
        assert_eq!(buffer.prev(0, Level::Frame).unwrap(), None);
    }

    #[test]
    fn sinks_can_be_unregistered() {
        use crate::sink::ModifiedAddressSink;
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut buffer = TraceBuffer::new();
        let a = buffer.register_sink(Rc::new(RefCell::new(ModifiedAddressSink::<u16>::new())));
        let b = buffer.register_sink(Rc::new(RefCell::new(ModifiedAddressSink::<u16>::new())));
        assert_ne!(a, b);
        assert_eq!(buffer.sinks().len(), 2);
        assert!(buffer.unregister_sink(a));
        assert!(!buffer.unregister_sink(a));
        assert_eq!(buffer.sinks().len(), 1);
    }
}
