//! Error types for the protocol layer.
//!
//! Everything in this crate is pure: these errors only ever describe bad
//! input (a malformed host string, a truncated sockaddr buffer), never I/O.

/// Errors that can occur while parsing or decoding endpoint addresses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A textual host could not be turned into an address.
    ///
    /// Missing groups are tolerated (they decode as zero), but too many
    /// groups or a group that is not a number in range are rejected.
    #[error("invalid address {host:?}: {reason}")]
    InvalidAddress {
        /// The host string as given by the caller.
        host: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A raw sockaddr buffer is shorter than its family requires.
    #[error("truncated socket address: need {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum length for the family (or for the family field itself).
        expected: usize,
        /// Length of the buffer that was supplied.
        actual: usize,
    },

    /// The family field of a raw sockaddr is neither IPv4 nor IPv6.
    #[error("unsupported address family {0}")]
    UnknownFamily(u16),
}

impl ProtocolError {
    pub(crate) fn invalid(host: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            host: host.to_string(),
            reason: reason.into(),
        }
    }
}
