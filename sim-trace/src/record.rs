use std::fmt;

use num_traits::{PrimInt, Unsigned};

use crate::Level;

/// Identifier of a traced device (memory, register bank, ...).
pub type DeviceId = u16;

/// Identifier of an address-translation path. Path `0` means "untranslated".
pub type PathId = u16;

/// Maximum number of bytes carried by a single payload fragment.
pub const PAYLOAD_MAX: usize = 32;

/// Maximum width of an encoded address.
pub const ADDRESS_MAX: usize = 8;

/// Encoded size of a frame header. Frame headers are fixed-width so that their length can be
/// patched in place once the frame is closed.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Enumeration of possible fragment types.
///
/// This type corresponds to the first byte of every fragment in the log.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FragmentKind {
    Frame = 0x01,
    Clear = 0x10,
    PureRead = 0x11,
    ImpureRead = 0x12,
    Write = 0x13,
    Increment = 0x14,
    Payload = 0x20,
}

/// Error type for failed conversions from `u8` to [`FragmentKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown fragment kind: {0:#04x}")]
pub struct UnknownFragmentKind(pub u8);

impl TryFrom<u8> for FragmentKind {
    type Error = UnknownFragmentKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Frame),
            0x10 => Ok(Self::Clear),
            0x11 => Ok(Self::PureRead),
            0x12 => Ok(Self::ImpureRead),
            0x13 => Ok(Self::Write),
            0x14 => Ok(Self::Increment),
            0x20 => Ok(Self::Payload),
            _ => Err(UnknownFragmentKind(value)),
        }
    }
}

impl FragmentKind {
    /// Returns the granularity at which fragments of this kind live.
    pub fn level(&self) -> Level {
        match self {
            Self::Frame => Level::Frame,
            Self::Payload => Level::Payload,
            _ => Level::Packet,
        }
    }
}

/// Byte string of at most `N` bytes stored inline.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct VariableBytes<const N: usize> {
    len: u8,
    bytes: [u8; N],
}

impl<const N: usize> VariableBytes<N> {
    /// Copies `src` into a new value. Fails if `src` is longer than `N`.
    pub fn new(src: &[u8]) -> Result<Self, ParseError> {
        if src.len() > N {
            return Err(Error::TooManyBytes(src.len(), N).into());
        }
        let mut bytes = [0u8; N];
        bytes[..src.len()].copy_from_slice(src);
        Ok(Self {
            len: src.len() as u8,
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let (&len, rest) = bytes.split_first().ok_or(Error::NotEnoughBytes)?;
        let len = len as usize;
        if rest.len() < len {
            return Err(Error::NotEnoughBytes.into());
        }
        let (value, rest) = rest.split_at(len);
        Ok((Self::new(value)?, rest))
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.len);
        buffer.extend_from_slice(self.as_slice());
    }
}

impl<const N: usize> fmt::Debug for VariableBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// A little-endian address of 1 to 8 bytes. The width is chosen by the producer.
pub type AddressBytes = VariableBytes<ADDRESS_MAX>;

impl VariableBytes<ADDRESS_MAX> {
    /// Encodes `address` using the full width of `A`.
    pub fn from_address<A: PrimInt + Unsigned>(address: A) -> Self {
        let width = std::mem::size_of::<A>().min(ADDRESS_MAX);
        Self::from_u64(address.to_u64().unwrap_or(u64::MAX), width)
    }

    /// Encodes the low `width` bytes of `value`. `width` is clamped to `1..=8`.
    pub fn from_u64(value: u64, width: usize) -> Self {
        let width = width.clamp(1, ADDRESS_MAX);
        let mut bytes = [0u8; ADDRESS_MAX];
        bytes[..width].copy_from_slice(&value.to_le_bytes()[..width]);
        Self {
            len: width as u8,
            bytes,
        }
    }

    pub fn to_u64(&self) -> u64 {
        let mut buffer = [0u8; ADDRESS_MAX];
        buffer[..self.len()].copy_from_slice(self.as_slice());
        u64::from_le_bytes(buffer)
    }

    /// Returns the largest address representable in this width.
    pub fn mask(&self) -> u64 {
        match self.len() {
            0 => 0,
            n if n >= ADDRESS_MAX => u64::MAX,
            n => (1u64 << (n * 8)) - 1,
        }
    }

    /// Decodes the address, truncating it to the width of `A`.
    pub fn to_address<A: PrimInt + Unsigned>(&self) -> A {
        let max = A::max_value().to_u64().unwrap_or(u64::MAX);
        <A as num_traits::NumCast>::from(self.to_u64() & max).unwrap_or_else(A::max_value)
    }

    fn parse_address(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let (address, rest) = Self::parse(bytes)?;
        if address.is_empty() {
            return Err(Error::BadData.into());
        }
        Ok((address, rest))
    }
}

/// Frame header. Frames group the packets produced by one simulator step.
///
/// # Format
///
/// `| 0x01 | length: le16 | back_offset: le16 |`
///
/// `length` spans the whole frame including this header, and stays `0` while the frame is
/// open. `back_offset` is the distance back to the previous frame header, `0` for the first.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    length: u16,
    back_offset: u16,
}

impl FrameHeader {
    pub fn new(length: u16, back_offset: u16) -> Self {
        Self {
            length,
            back_offset,
        }
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn back_offset(&self) -> u16 {
        self.back_offset
    }

    /// Overwrites the length field of the encoded frame header at the start of `bytes`.
    pub(crate) fn patch_length(bytes: &mut [u8], length: u16) {
        if let Some(field) = bytes.get_mut(1..3) {
            field.copy_from_slice(&length.to_le_bytes());
        }
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let (length, rest) = parse_le16(bytes)?;
        let (back_offset, rest) = parse_le16(rest)?;
        Ok((
            Self {
                length,
                back_offset,
            },
            rest,
        ))
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        let mut bytes = [FragmentKind::Frame as u8, 0, 0, 0, 0];
        bytes[1..3].copy_from_slice(&self.length.to_le_bytes());
        bytes[3..5].copy_from_slice(&self.back_offset.to_le_bytes());
        buffer.extend_from_slice(&bytes)
    }
}

/// Packet indicating that every value held by a device was reset.
///
/// # Format
///
/// `| 0x10 | device: varint |`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Clear {
    device: DeviceId,
}

impl Clear {
    pub fn new(device: DeviceId) -> Self {
        Self { device }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let (device, rest) = parse_id(bytes)?;
        Ok((Self { device }, rest))
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.push(FragmentKind::Clear as u8);
        emit_varint(self.device as u64, buffer);
    }
}

/// Packet describing a side-effect free read. Only the length of the read is recorded, no
/// payload fragments follow.
///
/// # Format
///
/// `| 0x11 | device: varint | path: varint | payload_len: varint | address: vbytes |`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PureRead {
    device: DeviceId,
    path: PathId,
    payload_len: u64,
    address: AddressBytes,
}

impl PureRead {
    pub fn new(device: DeviceId, path: PathId, address: AddressBytes, payload_len: u64) -> Self {
        Self {
            device,
            path,
            payload_len,
            address,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn path(&self) -> PathId {
        self.path
    }

    pub fn address(&self) -> &AddressBytes {
        &self.address
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let (device, rest) = parse_id(bytes)?;
        let (path, rest) = parse_id(rest)?;
        let (payload_len, rest) = parse_varint(rest)?;
        let (address, rest) = AddressBytes::parse_address(rest)?;
        Ok((
            Self {
                device,
                path,
                payload_len,
                address,
            },
            rest,
        ))
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.push(FragmentKind::PureRead as u8);
        emit_varint(self.device as u64, buffer);
        emit_varint(self.path as u64, buffer);
        emit_varint(self.payload_len, buffer);
        self.address.emit(buffer);
    }
}

macro_rules! generate_addressed_packet {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            device: DeviceId,
            path: PathId,
            address: AddressBytes,
        }

        impl $name {
            pub fn new(device: DeviceId, path: PathId, address: AddressBytes) -> Self {
                Self {
                    device,
                    path,
                    address,
                }
            }

            pub fn device(&self) -> DeviceId {
                self.device
            }

            pub fn path(&self) -> PathId {
                self.path
            }

            pub fn address(&self) -> &AddressBytes {
                &self.address
            }

            fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
                let (device, rest) = parse_id(bytes)?;
                let (path, rest) = parse_id(rest)?;
                let (address, rest) = AddressBytes::parse_address(rest)?;
                Ok((
                    Self {
                        device,
                        path,
                        address,
                    },
                    rest,
                ))
            }

            fn emit(&self, buffer: &mut Vec<u8>) {
                buffer.push($kind as u8);
                emit_varint(self.device as u64, buffer);
                emit_varint(self.path as u64, buffer);
                self.address.emit(buffer);
            }
        }
    };
}

generate_addressed_packet!(
    /// Packet describing a read with side effects (e.g. a memory-mapped input port). The raw
    /// bytes that were read follow as payload fragments.
    ///
    /// # Format
    ///
    /// `| 0x12 | device: varint | path: varint | address: vbytes |`
    ImpureRead,
    FragmentKind::ImpureRead
);

generate_addressed_packet!(
    /// Packet describing a write. The `old ^ new` difference follows as payload fragments,
    /// or the raw bytes for memory-mapped writes.
    ///
    /// # Format
    ///
    /// `| 0x13 | device: varint | path: varint | address: vbytes |`
    Write,
    FragmentKind::Write
);

/// Packet describing an in-place increment. The signed addend follows as payload fragments.
///
/// # Format
///
/// `| 0x14 | device: varint | address: vbytes |`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Increment {
    device: DeviceId,
    address: AddressBytes,
}

impl Increment {
    pub fn new(device: DeviceId, address: AddressBytes) -> Self {
        Self { device, address }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn address(&self) -> &AddressBytes {
        &self.address
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let (device, rest) = parse_id(bytes)?;
        let (address, rest) = AddressBytes::parse_address(rest)?;
        Ok((Self { device, address }, rest))
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.push(FragmentKind::Increment as u8);
        emit_varint(self.device as u64, buffer);
        self.address.emit(buffer);
    }
}

/// A change reported by a device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketHeader {
    Clear(Clear),
    PureRead(PureRead),
    ImpureRead(ImpureRead),
    Write(Write),
    Increment(Increment),
}

impl PacketHeader {
    pub fn kind(&self) -> FragmentKind {
        match self {
            Self::Clear(_) => FragmentKind::Clear,
            Self::PureRead(_) => FragmentKind::PureRead,
            Self::ImpureRead(_) => FragmentKind::ImpureRead,
            Self::Write(_) => FragmentKind::Write,
            Self::Increment(_) => FragmentKind::Increment,
        }
    }

    pub fn device(&self) -> DeviceId {
        match self {
            Self::Clear(packet) => packet.device(),
            Self::PureRead(packet) => packet.device(),
            Self::ImpureRead(packet) => packet.device(),
            Self::Write(packet) => packet.device(),
            Self::Increment(packet) => packet.device(),
        }
    }

    /// Returns the translation path, for the packet kinds that carry one.
    pub fn path(&self) -> Option<PathId> {
        match self {
            Self::PureRead(packet) => Some(packet.path()),
            Self::ImpureRead(packet) => Some(packet.path()),
            Self::Write(packet) => Some(packet.path()),
            Self::Clear(_) | Self::Increment(_) => None,
        }
    }

    pub fn address(&self) -> Option<&AddressBytes> {
        match self {
            Self::Clear(_) => None,
            Self::PureRead(packet) => Some(packet.address()),
            Self::ImpureRead(packet) => Some(packet.address()),
            Self::Write(packet) => Some(packet.address()),
            Self::Increment(packet) => Some(packet.address()),
        }
    }

    /// Returns `true` if payload fragments follow this header in the log.
    pub fn has_payloads(&self) -> bool {
        !matches!(self, Self::Clear(_) | Self::PureRead(_))
    }

    pub(crate) fn with_path(self, path: PathId) -> Self {
        match self {
            Self::PureRead(packet) => Self::PureRead(PureRead { path, ..packet }),
            Self::ImpureRead(packet) => Self::ImpureRead(ImpureRead { path, ..packet }),
            Self::Write(packet) => Self::Write(Write { path, ..packet }),
            packet @ (Self::Clear(_) | Self::Increment(_)) => packet,
        }
    }

    fn parse(kind: FragmentKind, bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        match kind {
            FragmentKind::Clear => Clear::parse(bytes)
                .map(|(packet, rest)| (Self::Clear(packet), rest))
                .map_err(|e| Error::wrap("clear", e).into()),
            FragmentKind::PureRead => PureRead::parse(bytes)
                .map(|(packet, rest)| (Self::PureRead(packet), rest))
                .map_err(|e| Error::wrap("pure read", e).into()),
            FragmentKind::ImpureRead => ImpureRead::parse(bytes)
                .map(|(packet, rest)| (Self::ImpureRead(packet), rest))
                .map_err(|e| Error::wrap("impure read", e).into()),
            FragmentKind::Write => Write::parse(bytes)
                .map(|(packet, rest)| (Self::Write(packet), rest))
                .map_err(|e| Error::wrap("write", e).into()),
            FragmentKind::Increment => Increment::parse(bytes)
                .map(|(packet, rest)| (Self::Increment(packet), rest))
                .map_err(|e| Error::wrap("increment", e).into()),
            FragmentKind::Frame | FragmentKind::Payload => Err(Error::BadData.into()),
        }
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        match self {
            Self::Clear(packet) => packet.emit(buffer),
            Self::PureRead(packet) => packet.emit(buffer),
            Self::ImpureRead(packet) => packet.emit(buffer),
            Self::Write(packet) => packet.emit(buffer),
            Self::Increment(packet) => packet.emit(buffer),
        }
    }
}

macro_rules! generate_packet_from {
    ($($name:ident),*) => {
        $(
            impl From<$name> for PacketHeader {
                fn from(value: $name) -> Self {
                    Self::$name(value)
                }
            }

            impl From<$name> for Fragment {
                fn from(value: $name) -> Self {
                    Self::Packet(PacketHeader::$name(value))
                }
            }
        )*
    };
}

generate_packet_from!(Clear, PureRead, ImpureRead, Write, Increment);

/// One chunk of a packet's data.
///
/// # Format
///
/// `| 0x20 | len_flags: u8 | bytes: [u8; len] |`
///
/// Bit 7 of `len_flags` is set when another fragment of the same logical payload follows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Payload {
    bytes: VariableBytes<PAYLOAD_MAX>,
    continues: bool,
}

impl Payload {
    const CONTINUES: u8 = 0x80;
    const LEN_MASK: u8 = 0x7f;

    /// Constructs a fragment holding `bytes`. Fails if more than [`PAYLOAD_MAX`] bytes are given.
    pub fn new(bytes: &[u8], continues: bool) -> Result<Self, ParseError> {
        Ok(Self {
            bytes: VariableBytes::new(bytes)?,
            continues,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn continues(&self) -> bool {
        self.continues
    }

    /// Splits `bytes` into as many fragments as needed, marking all but the last as continuing.
    pub fn split(bytes: &[u8]) -> Vec<Self> {
        let count = bytes.chunks(PAYLOAD_MAX).count();
        bytes
            .chunks(PAYLOAD_MAX)
            .enumerate()
            .map(|(index, chunk)| {
                let mut inline = [0u8; PAYLOAD_MAX];
                inline[..chunk.len()].copy_from_slice(chunk);
                Self {
                    bytes: VariableBytes {
                        len: chunk.len() as u8,
                        bytes: inline,
                    },
                    continues: index + 1 < count,
                }
            })
            .collect()
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let (&flags, rest) = bytes.split_first().ok_or(Error::NotEnoughBytes)?;
        let len = (flags & Self::LEN_MASK) as usize;
        if len > PAYLOAD_MAX {
            return Err(Error::TooManyBytes(len, PAYLOAD_MAX).into());
        }
        if rest.len() < len {
            return Err(Error::NotEnoughBytes.into());
        }
        let (value, rest) = rest.split_at(len);
        Ok((
            Self {
                bytes: VariableBytes::new(value)?,
                continues: flags & Self::CONTINUES != 0,
            },
            rest,
        ))
    }

    fn emit(&self, buffer: &mut Vec<u8>) {
        let flags = self.bytes.len | if self.continues { Self::CONTINUES } else { 0 };
        buffer.push(FragmentKind::Payload as u8);
        buffer.push(flags);
        buffer.extend_from_slice(self.bytes());
    }
}

/// Any record that can appear in the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Fragment {
    Frame(FrameHeader),
    Packet(PacketHeader),
    Payload(Payload),
}

impl Fragment {
    pub fn kind(&self) -> FragmentKind {
        match self {
            Self::Frame(_) => FragmentKind::Frame,
            Self::Packet(packet) => packet.kind(),
            Self::Payload(_) => FragmentKind::Payload,
        }
    }

    pub fn level(&self) -> Level {
        self.kind().level()
    }

    /// Decodes the fragment at the start of `bytes`, returning it and its encoded size.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), ParseError> {
        let (&tag, body) = bytes.split_first().ok_or(Error::NotEnoughBytes)?;
        let kind = FragmentKind::try_from(tag).map_err(Error::from)?;
        let (fragment, rest) = match kind {
            FragmentKind::Frame => FrameHeader::parse(body)
                .map(|(header, rest)| (Self::Frame(header), rest))
                .map_err(|e| Error::wrap("frame", e))?,
            FragmentKind::Payload => Payload::parse(body)
                .map(|(payload, rest)| (Self::Payload(payload), rest))
                .map_err(|e| Error::wrap("payload", e))?,
            kind => PacketHeader::parse(kind, body)
                .map(|(packet, rest)| (Self::Packet(packet), rest))?,
        };
        Ok((fragment, bytes.len() - rest.len()))
    }

    pub fn emit(&self, buffer: &mut Vec<u8>) {
        match self {
            Self::Frame(header) => header.emit(buffer),
            Self::Packet(packet) => packet.emit(buffer),
            Self::Payload(payload) => payload.emit(buffer),
        }
    }

    /// Returns the number of bytes [`Fragment::emit`] will append.
    pub fn encoded_len(&self) -> usize {
        let address = |address: &AddressBytes| 1 + address.len();
        match self {
            Self::Frame(_) => FRAME_HEADER_SIZE,
            Self::Payload(payload) => 2 + payload.len(),
            Self::Packet(PacketHeader::Clear(packet)) => 1 + varint_len(packet.device as u64),
            Self::Packet(PacketHeader::PureRead(packet)) => {
                1 + varint_len(packet.device as u64)
                    + varint_len(packet.path as u64)
                    + varint_len(packet.payload_len)
                    + address(&packet.address)
            }
            Self::Packet(PacketHeader::ImpureRead(packet)) => {
                1 + varint_len(packet.device as u64)
                    + varint_len(packet.path as u64)
                    + address(&packet.address)
            }
            Self::Packet(PacketHeader::Write(packet)) => {
                1 + varint_len(packet.device as u64)
                    + varint_len(packet.path as u64)
                    + address(&packet.address)
            }
            Self::Packet(PacketHeader::Increment(packet)) => {
                1 + varint_len(packet.device as u64) + address(&packet.address)
            }
        }
    }
}

impl From<FrameHeader> for Fragment {
    fn from(value: FrameHeader) -> Self {
        Self::Frame(value)
    }
}

impl From<PacketHeader> for Fragment {
    fn from(value: PacketHeader) -> Self {
        Self::Packet(value)
    }
}

impl From<Payload> for Fragment {
    fn from(value: Payload) -> Self {
        Self::Payload(value)
    }
}

/// XORs `delta` into `target`, over the shorter of the two.
///
/// Applying the payload of a [`Write`] to the old value yields the new value and vice versa.
pub fn xor_into(target: &mut [u8], delta: &[u8]) {
    for (byte, delta) in target.iter_mut().zip(delta) {
        *byte ^= *delta;
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ParseError(#[from] Error);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse {0:} fragment")]
    ParseFragment(String, #[source] Box<Error>),

    #[error(transparent)]
    UnknownFragmentKind(#[from] UnknownFragmentKind),

    #[error("fragment data does not contain enough bytes")]
    NotEnoughBytes,

    #[error("variable length field holds {0} bytes, at most {1} are allowed")]
    TooManyBytes(usize, usize),

    #[error("variable length integer does not fit its field")]
    IntegerOverflow,

    #[error("data present for fragment did not match the required format")]
    BadData,
}

impl Error {
    fn wrap(s: &str, e: ParseError) -> Self {
        Self::ParseFragment(String::from(s), Box::new(e.0))
    }
}

pub fn parse_le16(bytes: &[u8]) -> Result<(u16, &[u8]), ParseError> {
    if bytes.len() < 2 {
        return Err(Error::NotEnoughBytes.into());
    }
    let (left, right) = bytes.split_at(2);
    Ok((u16::from_le_bytes([left[0], left[1]]), right))
}

/// Decodes an unsigned LEB128 integer.
pub fn parse_varint(bytes: &[u8]) -> Result<(u64, &[u8]), ParseError> {
    let mut value = 0u64;
    for (index, &byte) in bytes.iter().enumerate() {
        if index >= 10 || (index == 9 && byte > 1) {
            return Err(Error::IntegerOverflow.into());
        }
        value |= ((byte & 0x7f) as u64) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok((value, &bytes[index + 1..]));
        }
    }
    Err(Error::NotEnoughBytes.into())
}

pub fn emit_varint(mut value: u64, buffer: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buffer.push(byte);
            return;
        }
        buffer.push(byte | 0x80);
    }
}

pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

fn parse_id(bytes: &[u8]) -> Result<(u16, &[u8]), ParseError> {
    let (value, rest) = parse_varint(bytes)?;
    let value = u16::try_from(value).map_err(|_| Error::IntegerOverflow)?;
    Ok((value, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(fragment: impl Into<Fragment>) -> Vec<u8> {
        let mut buffer = Vec::new();
        fragment.into().emit(&mut buffer);
        buffer
    }

    #[test]
    fn kinds_map_to_levels() {
        assert_eq!(FragmentKind::try_from(0x01).unwrap().level(), Level::Frame);
        assert_eq!(FragmentKind::try_from(0x13).unwrap().level(), Level::Packet);
        assert_eq!(FragmentKind::try_from(0x20).unwrap().level(), Level::Payload);
        assert_eq!(FragmentKind::try_from(0x7e), Err(UnknownFragmentKind(0x7e)));
    }

    #[test]
    fn frame_header_layout() {
        let bytes = encode(FrameHeader::new(0x1234, 0x0042));
        assert_eq!(bytes, [0x01, 0x34, 0x12, 0x42, 0x00]);

        let mut patched = bytes.clone();
        FrameHeader::patch_length(&mut patched, 7);
        let (fragment, size) = Fragment::parse(&patched).unwrap();
        assert_eq!(size, FRAME_HEADER_SIZE);
        assert_eq!(fragment, Fragment::Frame(FrameHeader::new(7, 0x42)));
    }

    #[test]
    fn write_header_layout() {
        let header = Write::new(300, 2, AddressBytes::from_address(0xbeefu16));
        let bytes = encode(header);
        assert_eq!(bytes, [0x13, 0xac, 0x02, 0x02, 0x02, 0xef, 0xbe]);
        assert_eq!(Fragment::from(header).encoded_len(), bytes.len());

        let (fragment, size) = Fragment::parse(&bytes).unwrap();
        assert_eq!(size, bytes.len());
        let Fragment::Packet(packet) = fragment else {
            panic!("expected a packet header, got {fragment:?}");
        };
        assert_eq!(packet.device(), 300);
        assert_eq!(packet.path(), Some(2));
        assert_eq!(packet.address().map(|a| a.to_u64()), Some(0xbeef));
    }

    #[test]
    fn payload_flags() {
        let payload = Payload::new(&[1, 2, 3], true).unwrap();
        let bytes = encode(payload);
        assert_eq!(bytes, [0x20, 0x83, 1, 2, 3]);
        let (fragment, _) = Fragment::parse(&bytes).unwrap();
        assert_eq!(fragment, Fragment::Payload(payload));

        assert!(Payload::new(&[0u8; PAYLOAD_MAX + 1], false).is_err());
        assert!(Fragment::parse(&[0x20, 0x21]).is_err());
    }

    #[test]
    fn split_marks_continuations() {
        let data = [0xa5u8; 2 * PAYLOAD_MAX + 5];
        let chunks = Payload::split(&data);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].continues() && chunks[1].continues());
        assert!(!chunks[2].continues());
        assert_eq!(chunks[2].len(), 5);
        assert!(Payload::split(&[]).is_empty());
    }

    #[test]
    fn truncated_fragments_fail() {
        let bytes = encode(PureRead::new(1, 0, AddressBytes::from_address(0x10u32), 4));
        for end in 0..bytes.len() {
            assert!(Fragment::parse(&bytes[..end]).is_err(), "prefix {end} parsed");
        }
        assert!(Fragment::parse(&bytes).is_ok());
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!(Fragment::parse(&[0x14, 0x01, 0x00]).is_err());
    }

    #[test]
    fn varint_lengths() {
        for value in [0u64, 1, 0x7f, 0x80, 0x3fff, 0x4000, u32::MAX as u64, u64::MAX] {
            let mut buffer = Vec::new();
            emit_varint(value, &mut buffer);
            assert_eq!(buffer.len(), varint_len(value));
            let (decoded, rest) = parse_varint(&buffer).unwrap();
            assert_eq!(decoded, value);
            assert!(rest.is_empty());
        }
        assert!(parse_varint(&[0xff; 11]).is_err());
    }

    #[test]
    fn address_widths() {
        let address = AddressBytes::from_address(0x12u8);
        assert_eq!(address.len(), 1);
        assert_eq!(address.mask(), 0xff);

        let address = AddressBytes::from_u64(0x1_2345, 2);
        assert_eq!(address.to_u64(), 0x2345);
        assert_eq!(address.to_address::<u8>(), 0x45);
        assert_eq!(AddressBytes::from_address(u64::MAX).mask(), u64::MAX);
    }

    #[test]
    fn xor_is_an_involution() {
        let old = [0x00u8, 0x0f, 0xf0];
        let new = [0xffu8, 0x0f, 0x00];
        let mut delta = old;
        xor_into(&mut delta, &new);

        let mut value = old;
        xor_into(&mut value, &delta);
        assert_eq!(value, new);
        xor_into(&mut value, &delta);
        assert_eq!(value, old);
    }
}
