//! uTP packet header inspection.
//!
//! The demultiplexer only needs to know whether a datagram *looks like*
//! uTP. We never parse the rest of an engine packet; the engine does that.
//!
//! ```text
//!  0       4       8               16              24              32
//! +-------+-------+---------------+---------------+---------------+
//! | type  | ver   | extension     | connection_id                 |
//! +-------+-------+---------------+---------------+---------------+
//! | timestamp_microseconds                                        |
//! +---------------+---------------+---------------+---------------+
//! | timestamp_difference_microseconds                             |
//! +---------------+---------------+---------------+---------------+
//! | wnd_size                                                      |
//! +---------------+---------------+---------------+---------------+
//! | seq_nr                        | ack_nr                        |
//! +---------------+---------------+---------------+---------------+
//! ```

use std::fmt;

/// Length of the fixed uTP header.
pub const HEADER_LEN: usize = 20;

/// The only protocol version the engine speaks.
pub const UTP_VERSION: u8 = 1;

/// Number of defined packet types (`ST_DATA` .. `ST_SYN`).
pub const PACKET_TYPE_COUNT: u8 = 5;

/// Extension-type values below this are considered plausible.
pub const EXTENSION_LIMIT: u8 = 3;

/// uTP packet types, from the high nibble of byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::Data),
            1 => Some(Self::Fin),
            2 => Some(Self::State),
            3 => Some(Self::Reset),
            4 => Some(Self::Syn),
            _ => None,
        }
    }
}

/// The fields of a header that passed classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub extension: u8,
    pub connection_id: u16,
}

impl PacketHeader {
    /// Returns the header if `datagram` is shaped like uTP, `None` otherwise.
    pub fn peek(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < HEADER_LEN {
            return None;
        }
        let version = datagram[0] & 0x0f;
        let kind = datagram[0] >> 4;
        let extension = datagram[1];
        if version != UTP_VERSION || kind >= PACKET_TYPE_COUNT || extension >= EXTENSION_LIMIT {
            return None;
        }
        Some(Self {
            packet_type: PacketType::from_nibble(kind)?,
            extension,
            connection_id: u16::from_be_bytes([datagram[2], datagram[3]]),
        })
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Which receiver a datagram on a shared port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    /// Shaped like a uTP packet; goes to the engine.
    Engine,
    /// Anything else; goes to the co-hosted protocol.
    Other,
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine => f.write_str("engine"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Classifies a raw datagram.
///
/// Engine traffic is at least [`HEADER_LEN`] bytes, has version
/// [`UTP_VERSION`] in the low nibble of byte 0, a packet type below
/// [`PACKET_TYPE_COUNT`] in the high nibble, and an extension byte below
/// [`EXTENSION_LIMIT`]. A datagram from another protocol that happens to
/// match this shape is misrouted; the engine drops it.
pub fn classify(datagram: &[u8]) -> Traffic {
    if PacketHeader::peek(datagram).is_some() {
        Traffic::Engine
    } else {
        Traffic::Other
    }
}
