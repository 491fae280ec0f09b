use std::cell::RefCell;
use std::rc::Rc;

use num_traits::{NumCast, PrimInt, Unsigned};
use tracing::trace;

use crate::interval::{Interval, IntervalSet};
use crate::iter::{FrameRef, PacketRef};
use crate::record::{DeviceId, PacketHeader, PathId};
use crate::{Direction, TraceError};

/// Consumer of packets. Sinks are handed packets by [`drive`], the buffer never calls them.
pub trait Sink {
    fn analyze(&mut self, packet: &PacketRef<'_>, direction: Direction) -> Result<(), TraceError>;
}

/// How sinks are shared between a [`crate::TraceBuffer`] and the code that reads their results.
pub type SharedSink = Rc<RefCell<dyn Sink>>;

/// Hands every packet of `frames` to every sink and returns the number of packets visited.
///
/// With [`Direction::Reverse`] the packets of each frame are visited last to first. Pass the
/// frames in the matching order, e.g. `buffer.frames().rev()`.
pub fn drive<'b, F>(
    sinks: &[SharedSink],
    frames: F,
    direction: Direction,
) -> Result<usize, TraceError>
where
    F: IntoIterator<Item = Result<FrameRef<'b>, TraceError>>,
{
    let _span = tracing::trace_span!("drive", ?direction, sinks = sinks.len()).entered();
    let mut visited = 0;
    for frame in frames {
        let frame = frame?;
        let mut packets = frame.packets();
        loop {
            let packet = match direction {
                Direction::Forward => packets.next(),
                Direction::Reverse => packets.next_back(),
            };
            let Some(packet) = packet else {
                break;
            };
            let packet = packet?;
            for sink in sinks {
                sink.borrow_mut().analyze(&packet, direction)?;
            }
            visited += 1;
        }
    }
    trace!(visited = visited, "sink pass finished");
    Ok(visited)
}

type Translator<A> = Box<dyn Fn(DeviceId, PathId, A) -> A>;

/// Collects the addresses touched by packets.
///
/// Only grows, replaying a step backward still adds the addresses it touches.
pub struct ModifiedAddressSink<A> {
    modified: IntervalSet<A>,
    include_reads: bool,
    translate: Option<Translator<A>>,
}

impl<A: PrimInt + Unsigned> Default for ModifiedAddressSink<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PrimInt + Unsigned> ModifiedAddressSink<A> {
    pub fn new() -> Self {
        Self {
            modified: IntervalSet::new(),
            include_reads: false,
            translate: None,
        }
    }

    /// Also count pure reads as touched addresses.
    pub fn with_reads(mut self, include_reads: bool) -> Self {
        self.include_reads = include_reads;
        self
    }

    /// Maps device addresses into the observer's address space before they are recorded.
    pub fn with_translator<F>(mut self, translate: F) -> Self
    where
        F: Fn(DeviceId, PathId, A) -> A + 'static,
    {
        self.translate = Some(Box::new(translate));
        self
    }

    pub fn clear(&mut self) {
        self.modified.clear();
    }

    pub fn intervals(&self) -> impl Iterator<Item = Interval<A>> + '_ {
        self.modified.intervals()
    }

    pub fn modified(&self) -> &IntervalSet<A> {
        &self.modified
    }

    pub fn contains(&self, address: A) -> bool {
        self.modified.contains(address)
    }

    /// Records `len` bytes starting at the packet's address. The range wraps at the width of the
    /// encoded address.
    pub fn record(&mut self, header: &PacketHeader, len: u64) {
        let Some(address) = header.address() else {
            return;
        };
        if len == 0 {
            return;
        }
        let domain = A::max_value().to_u64().unwrap_or(u64::MAX);
        let mask = address.mask() & domain;
        let start = address.to_u64() & mask;
        let path = header.path().unwrap_or(0);
        let device = header.device();

        if len - 1 >= mask {
            self.insert(device, path, 0, mask, mask);
            return;
        }
        let end = start.wrapping_add(len - 1) & mask;
        self.insert(device, path, start, end, mask);
    }

    fn insert(&mut self, device: DeviceId, path: PathId, start: u64, end: u64, mask: u64) {
        let map = |value: u64| {
            let value = <A as NumCast>::from(value).unwrap_or_else(A::max_value);
            match &self.translate {
                Some(translate) => translate(device, path, value),
                None => value,
            }
        };
        let (start, end, top) = (map(start), map(end), map(mask));
        if end < start {
            self.modified.insert(start, top);
            self.modified.insert(map(0), end);
        } else {
            self.modified.insert(start, end);
        }
    }
}

impl<A: PrimInt + Unsigned> Sink for ModifiedAddressSink<A> {
    fn analyze(&mut self, packet: &PacketRef<'_>, _direction: Direction) -> Result<(), TraceError> {
        let len = packet.payload_len(self.include_reads)?;
        self.record(packet.header(), len);
        Ok(())
    }
}
