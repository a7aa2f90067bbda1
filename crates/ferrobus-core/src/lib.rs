//! Modbus protocol encoding and framing.
//!
//! `ferrobus-core` converts between typed Modbus requests/responses and PDU
//! byte sequences, and frames PDUs for the TCP (MBAP) and serial (RTU)
//! transports. It performs no I/O and is `no_std`-compatible; all encoding
//! goes through caller-owned buffers.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod encoding;
pub mod error;
pub mod frame;
pub mod pdu;

pub use error::{DecodeError, EncodeError};
