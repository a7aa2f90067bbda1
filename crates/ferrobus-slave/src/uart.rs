//! Timed-UART and RTS abstractions consumed by the RTU engine.

use crate::{RtuSlaveConfig, SlaveError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{FlowControl, SerialPortBuilderExt, SerialStream};

/// One received byte together with the silent interval that preceded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedByte {
    pub gap: Duration,
    pub byte: u8,
}

impl TimedByte {
    pub const fn new(gap: Duration, byte: u8) -> Self {
        Self { gap, byte }
    }
}

/// A serial port delivering receive bytes with inter-character timing.
#[async_trait]
pub trait TimedUart: Send {
    /// Wait for the next byte. `Ok(None)` means the port closed.
    async fn recv(&mut self) -> std::io::Result<Option<TimedByte>>;

    /// Queue a complete frame for transmission.
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Block until the last queued byte has been clocked out.
    async fn flush(&mut self) -> std::io::Result<()>;
}

/// Drives the RS-485 transmit-enable line. Held active for the whole
/// assert-write-flush sequence.
pub trait RtsPin: Send {
    fn set_active(&mut self, active: bool);
}

/// For transceivers with automatic direction control.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRts;

impl RtsPin for NoRts {
    fn set_active(&mut self, _active: bool) {}
}

/// [`TimedUart`] over a tokio-serial stream, stamping each byte with the
/// interval since the previous one. The very first byte reports
/// [`Duration::MAX`] so it always starts a frame.
pub struct SerialTimedUart {
    stream: SerialStream,
    last_byte_at: Option<Instant>,
}

impl SerialTimedUart {
    pub fn open(path: &str, config: &RtuSlaveConfig) -> Result<Self, SlaveError> {
        let builder = tokio_serial::new(path, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(FlowControl::None);
        let stream = builder.open_native_async().map_err(|err| {
            SlaveError::Io(std::io::Error::other(format!(
                "failed to open serial port '{path}': {err}"
            )))
        })?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: SerialStream) -> Self {
        Self {
            stream,
            last_byte_at: None,
        }
    }
}

#[async_trait]
impl TimedUart for SerialTimedUart {
    async fn recv(&mut self) -> std::io::Result<Option<TimedByte>> {
        let mut byte = [0u8; 1];
        let n = self.stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(None);
        }
        let now = Instant::now();
        let gap = self
            .last_byte_at
            .map(|previous| now.duration_since(previous))
            .unwrap_or(Duration::MAX);
        self.last_byte_at = Some(now);
        Ok(Some(TimedByte::new(gap, byte[0])))
    }

    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(frame).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush().await
    }
}
