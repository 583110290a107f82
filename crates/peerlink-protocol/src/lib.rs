//! Wire-level types shared with the native uTP engine.
//!
//! This crate is pure. It knows two things about the bytes the engine
//! produces and consumes:
//!
//! - **Addresses** ([`EndpointAddress`]): the exact `sockaddr_in` /
//!   `sockaddr_in6` layout the engine reads through its address pointers.
//! - **Headers** ([`classify`], [`PacketHeader`]): enough of the uTP header
//!   to tell engine datagrams apart from other traffic on a shared port.
//!
//! ```text
//! UDP socket (bytes) → classify → engine (process_udp) → callbacks (sockaddr)
//! ```

mod address;
mod error;
mod header;

pub use address::{
    AF_INET, AF_INET6, AddressFamily, EndpointAddress, SOCKADDR_IN_LEN, SOCKADDR_IN6_LEN,
};
pub use error::ProtocolError;
pub use header::{
    EXTENSION_LIMIT, HEADER_LEN, PACKET_TYPE_COUNT, PacketHeader, PacketType, Traffic,
    UTP_VERSION, classify,
};
