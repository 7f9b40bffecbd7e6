//! Packet envelope and its binary encoding.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use uuid::Uuid;

use crate::error::{Result, SessionError};

const ID_LEN: usize = 16;
const OPTIONS_LEN: usize = 4;
const DESCRIPTOR_LEN: usize = 4;
const BASE_LEN: usize = ID_LEN + OPTIONS_LEN;
const NO_DESCRIPTOR: i32 = -1;

/// Unique packet identifier, preserved verbatim through confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(Uuid);

impl PacketId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        self.0.as_bytes()
    }
}

impl Default for PacketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Option bit flags carried in every packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketOptions(u32);

impl PacketOptions {
    pub const NONE: Self = Self(0);
    pub const HAS_DATA: Self = Self(0x1);
    pub const HAS_DESCRIPTOR: Self = Self(0x2);
    pub const INTERNAL: Self = Self(0x4);
    pub const REQUIRES_CONFIRMATION: Self = Self(0x8);
    pub const CONFIRMATION: Self = Self(0x10);
    pub const SESSION_ID_PART: Self = Self(0x20);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Which side produced a packet instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Built locally for sending.
    Local,
    /// Decoded from a received frame.
    Remote,
}

/// A unit of application or control data exchanged over one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    id: PacketId,
    options: PacketOptions,
    source: Source,
    payload: Option<Vec<u8>>,
    descriptor: Option<i32>,
}

impl Packet {
    /// An application data packet.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: PacketId::new(),
            options: PacketOptions::HAS_DATA,
            source: Source::Local,
            payload: Some(payload.into()),
            descriptor: None,
        }
    }

    /// An internal control packet; never surfaced to the application.
    pub fn internal(payload: impl Into<Vec<u8>>) -> Self {
        let mut packet = Self::new(payload);
        packet.options |= PacketOptions::INTERNAL;
        packet
    }

    /// A confirmation for the packet with `id`. Carries no payload.
    pub fn confirmation(id: PacketId) -> Self {
        Self {
            id,
            options: PacketOptions::CONFIRMATION,
            source: Source::Local,
            payload: None,
            descriptor: None,
        }
    }

    /// Ask the peer to confirm receipt.
    pub fn requiring_confirmation(mut self) -> Self {
        self.options |= PacketOptions::REQUIRES_CONFIRMATION;
        self
    }

    /// Attach an application tag.
    pub fn with_descriptor(mut self, descriptor: impl Into<i32>) -> Self {
        if self.payload.is_none() {
            self.payload = Some(Vec::new());
            self.options |= PacketOptions::HAS_DATA;
        }
        self.descriptor = Some(descriptor.into());
        self.options |= PacketOptions::HAS_DESCRIPTOR;
        self
    }

    /// Add option flags.
    pub fn with_options(mut self, options: PacketOptions) -> Self {
        self.options |= options;
        self
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn options(&self) -> PacketOptions {
        self.options
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn has(&self, option: PacketOptions) -> bool {
        self.options.contains(option)
    }

    pub fn is_internal(&self) -> bool {
        self.has(PacketOptions::INTERNAL)
    }

    pub fn is_confirmation(&self) -> bool {
        self.has(PacketOptions::CONFIRMATION)
    }

    pub fn requires_confirmation(&self) -> bool {
        self.has(PacketOptions::REQUIRES_CONFIRMATION)
    }

    /// Payload bytes; empty for confirmations.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.payload().len()
    }

    /// Replace the payload, keeping id and options.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = Some(payload);
        self.options |= PacketOptions::HAS_DATA;
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload.unwrap_or_default()
    }

    pub fn descriptor(&self) -> Option<i32> {
        self.descriptor
    }

    /// The descriptor converted into an application enum or integer type.
    pub fn descriptor_as<T: TryFrom<i32>>(&self) -> Option<T> {
        self.descriptor.and_then(|raw| T::try_from(raw).ok())
    }

    /// Serialize into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload.as_deref();
        let mut buf = Vec::with_capacity(
            BASE_LEN + payload.map_or(0, |p| p.len() + DESCRIPTOR_LEN),
        );
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.options.bits().to_le_bytes());

        if self.has(PacketOptions::HAS_DATA) {
            buf.extend_from_slice(payload.unwrap_or(&[]));
            let descriptor = match self.descriptor {
                Some(value) if self.has(PacketOptions::HAS_DESCRIPTOR) => value,
                _ => NO_DESCRIPTOR,
            };
            buf.extend_from_slice(&descriptor.to_le_bytes());
        }
        buf
    }

    /// Parse a frame payload.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < BASE_LEN {
            return Err(SessionError::CorruptData(format!(
                "packet of {} bytes is shorter than its header",
                frame.len()
            )));
        }

        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&frame[..ID_LEN]);
        let mut options = [0u8; OPTIONS_LEN];
        options.copy_from_slice(&frame[ID_LEN..BASE_LEN]);
        let options = PacketOptions::from_bits(u32::from_le_bytes(options));

        let mut packet = Self {
            id: PacketId::from_bytes(id),
            options,
            source: Source::Remote,
            payload: None,
            descriptor: None,
        };

        if !options.contains(PacketOptions::HAS_DATA) {
            return Ok(packet);
        }

        if frame.len() < BASE_LEN + DESCRIPTOR_LEN {
            return Err(SessionError::CorruptData(format!(
                "data packet of {} bytes has no descriptor field",
                frame.len()
            )));
        }

        let body_end = frame.len() - DESCRIPTOR_LEN;
        let mut descriptor = [0u8; DESCRIPTOR_LEN];
        descriptor.copy_from_slice(&frame[body_end..]);

        packet.payload = Some(frame[BASE_LEN..body_end].to_vec());
        if options.contains(PacketOptions::HAS_DESCRIPTOR) {
            packet.descriptor = Some(i32::from_le_bytes(descriptor));
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_packet_round_trip() {
        let packet = Packet::new(b"hi".to_vec())
            .requiring_confirmation()
            .with_descriptor(42);

        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.id(), packet.id());
        assert_eq!(decoded.options(), packet.options());
        assert_eq!(decoded.payload(), b"hi");
        assert_eq!(decoded.descriptor(), Some(42));
        assert_eq!(decoded.source(), Source::Remote);
    }

    #[test]
    fn confirmation_is_header_only() {
        let original = Packet::new(b"payload".to_vec());
        let confirmation = Packet::confirmation(original.id());
        let bytes = confirmation.encode();
        assert_eq!(bytes.len(), BASE_LEN);

        let decoded = Packet::decode(&bytes).unwrap();
        assert!(decoded.is_confirmation());
        assert_eq!(decoded.id(), original.id());
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn missing_descriptor_encodes_sentinel() {
        let bytes = Packet::new(vec![1u8, 2, 3]).encode();
        assert_eq!(&bytes[bytes.len() - 4..], &(-1i32).to_le_bytes());

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.descriptor(), None);
        assert_eq!(decoded.payload(), &[1, 2, 3]);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let packet = Packet::internal(b"x".to_vec()).requiring_confirmation();
        let bytes = packet.encode();
        assert_eq!(&bytes[..16], packet.id().as_bytes());
        assert_eq!(&bytes[16..20], &(0x1u32 | 0x4 | 0x8).to_le_bytes());
    }

    #[test]
    fn short_frames_are_corrupt() {
        assert!(matches!(
            Packet::decode(&[0u8; 12]),
            Err(SessionError::CorruptData(_))
        ));

        let mut truncated = Packet::new(Vec::<u8>::new()).encode();
        truncated.truncate(BASE_LEN + 2);
        assert!(matches!(
            Packet::decode(&truncated),
            Err(SessionError::CorruptData(_))
        ));
    }

    #[test]
    fn descriptor_conversion() {
        #[derive(Debug, PartialEq)]
        enum Kind {
            Chat,
        }

        impl TryFrom<i32> for Kind {
            type Error = ();

            fn try_from(value: i32) -> std::result::Result<Self, ()> {
                match value {
                    7 => Ok(Kind::Chat),
                    _ => Err(()),
                }
            }
        }

        let packet = Packet::new(Vec::<u8>::new()).with_descriptor(7);
        assert_eq!(packet.descriptor_as::<Kind>(), Some(Kind::Chat));
        assert_eq!(Packet::new(Vec::<u8>::new()).with_descriptor(3).descriptor_as::<Kind>(), None);
        assert_eq!(packet.descriptor_as::<u8>(), Some(7));
    }

    #[test]
    fn options_flags() {
        let mut options = PacketOptions::HAS_DATA | PacketOptions::INTERNAL;
        assert!(options.contains(PacketOptions::INTERNAL));
        assert!(!options.contains(PacketOptions::CONFIRMATION));
        options.remove(PacketOptions::INTERNAL);
        assert_eq!(options, PacketOptions::HAS_DATA);
    }
}
