//! In-memory, replayable log of simulator side effects.
//!
//! Devices report what they changed as packets. Packets are grouped into frames, one per
//! simulator step, and carry their data in payload fragments. The log can be walked forward
//! and backward at any of the three granularities, and is reduced by [`sink::Sink`]
//! implementations such as [`sink::ModifiedAddressSink`].

pub mod buffer;
pub mod interval;
pub mod iter;
pub mod record;
pub mod sink;

pub use buffer::{PathGuard, SinkId, TraceBuffer};
pub use interval::{Interval, IntervalSet};
pub use iter::{BacklinkCache, FrameRef, Frames, PacketRef, Packets, PayloadRef, Payloads};
pub use record::{DeviceId, Fragment, FragmentKind, PacketHeader, PathId, Payload};
pub use sink::{drive, ModifiedAddressSink, SharedSink, Sink};

use record::ParseError;

/// Granularity of a position in the log. Ordered from coarsest to finest, so a fragment is
/// "at or above" a level when its own level compares less than or equal to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Frame,
    Packet,
    Payload,
}

/// Direction in which a sink observes the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Reverse,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("malformed fragment at offset {offset:#x}")]
    Parse {
        offset: usize,
        #[source]
        source: ParseError,
    },

    #[error("frame would span {span} bytes, at most {} are allowed", u16::MAX)]
    FrameOverflow { span: usize },

    #[error("expected a {expected:?} fragment at offset {offset:#x}")]
    UnexpectedFragment { offset: usize, expected: Level },

    #[error("frame header at offset {offset:#x} links back outside of the log")]
    BrokenBackLink { offset: usize },
}
