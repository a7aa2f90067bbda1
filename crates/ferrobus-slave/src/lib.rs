//! Async Modbus RTU slave.
//!
//! An [`RtuSlave`] consumes timed bytes from a UART, delimits request
//! frames by inter-character silence, validates address and CRC, and
//! dispatches typed requests to host-registered handlers. Responses go
//! back out under the half-duplex RTS discipline: assert, write, flush,
//! deassert.

#![forbid(unsafe_code)]

pub mod bank;
pub mod handlers;
pub mod uart;

mod dispatch;
mod engine;

pub use bank::DataBank;
pub use engine::RtuSlave;
pub use handlers::{
    DeviceIdObject, DeviceIdentity, HandlerRegistry, SlaveIdReport,
};
pub use uart::{NoRts, RtsPin, SerialTimedUart, TimedByte, TimedUart};

use ferrobus_core::{DecodeError, EncodeError};
use std::time::Duration;
use thiserror::Error;
use tokio_serial::{DataBits, Parity, StopBits};

/// The slave address reserved for broadcast requests.
pub const BROADCAST_ADDRESS: u8 = 0;

#[derive(Debug, Error)]
pub enum SlaveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// A frame addressed to us failed its CRC-16 check. Dropped silently
    /// on the wire, surfaced only through the error hook.
    #[error("invalid frame crc")]
    InvalidCrc,
    /// The leading PDU byte is not a recognized request, so the frame
    /// boundary cannot be predicted. The line is ignored until the next
    /// inter-frame gap.
    #[error("unrecognized function code {0:#04x}")]
    UnknownFunction(u8),
    /// The receive buffer filled without producing a complete frame.
    #[error("receive buffer overflow")]
    FrameTooLong,
}

/// Silence threshold separating RTU frames, in character times.
///
/// The serial-line spec mandates 3.5 character times; `Conservative`
/// stretches it to 4.5 for noisy lines or imprecise byte timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameGap {
    #[default]
    Standard,
    Conservative,
}

impl FrameGap {
    /// The silence duration at `baud_rate`, assuming 10-bit characters.
    pub fn threshold(self, baud_rate: u32) -> Duration {
        let micros = match self {
            Self::Standard => 35_000_000u64,
            Self::Conservative => 45_000_000u64,
        } / u64::from(baud_rate.max(1));
        Duration::from_micros(micros)
    }
}

/// Serial and framing parameters for an RTU slave.
#[derive(Debug, Clone, Copy)]
pub struct RtuSlaveConfig {
    pub slave_id: u8,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub frame_gap: FrameGap,
}

impl RtuSlaveConfig {
    pub fn new(slave_id: u8) -> Self {
        Self {
            slave_id,
            baud_rate: 19_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            frame_gap: FrameGap::default(),
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_frame_gap(mut self, frame_gap: FrameGap) -> Self {
        self.frame_gap = frame_gap;
        self
    }

    pub fn with_line_settings(
        mut self,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Self {
        self.data_bits = data_bits;
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::FrameGap;
    use std::time::Duration;

    #[test]
    fn gap_thresholds_at_19200_baud() {
        assert_eq!(
            FrameGap::Standard.threshold(19_200),
            Duration::from_micros(1822)
        );
        assert_eq!(
            FrameGap::Conservative.threshold(19_200),
            Duration::from_micros(2343)
        );
    }

    #[test]
    fn slower_lines_get_longer_gaps() {
        assert!(FrameGap::Standard.threshold(9_600) > FrameGap::Standard.threshold(115_200));
    }
}
