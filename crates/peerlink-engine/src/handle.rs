//! Opaque handles for native engine objects.
//!
//! A handle is the address of a `utp_context` or `utp_socket`, stored as a
//! plain integer so it can be hashed, compared, and sent across threads.
//! Raw pointers never leave the [`native`](crate::native) module.

use std::fmt;

use crate::ffi::{RawContext, RawSocket};

/// Identifies one engine instance (`utp_context *`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(usize);

/// Identifies one engine connection (`utp_socket *`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(usize);

macro_rules! handle_impl {
    ($name:ident, $raw:ty, $prefix:literal) => {
        impl $name {
            /// Wraps a raw handle value.
            pub const fn new(raw: usize) -> Self {
                Self(raw)
            }

            /// Returns the underlying integer.
            pub const fn into_inner(self) -> usize {
                self.0
            }

            /// `None` for a null pointer.
            pub(crate) fn from_ptr(ptr: *mut $raw) -> Option<Self> {
                if ptr.is_null() {
                    None
                } else {
                    Some(Self(ptr.expose_provenance()))
                }
            }

            pub(crate) fn as_ptr(self) -> *mut $raw {
                std::ptr::with_exposed_provenance_mut(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{:#x}"), self.0)
            }
        }
    };
}

handle_impl!(ContextHandle, RawContext, "ctx");
handle_impl!(SocketHandle, RawSocket, "sock");
