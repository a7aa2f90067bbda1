//! The RTU receive/transmit engine.
//!
//! Bytes arrive one at a time with their preceding silent interval. A
//! gap above the configured threshold starts a new frame; the expected
//! frame length is predicted from the function code so the engine knows
//! when a frame is complete without waiting for trailing silence.

use crate::dispatch::dispatch;
use crate::handlers::{
    DeviceIdentificationHandler, DiagnosticsHandler, ErrorHandler, ExceptionStatusHandler,
    HandlerRegistry, ReadHandler, ReportSlaveIdHandler, WriteHandler,
};
use crate::uart::{NoRts, RtsPin, SerialTimedUart, TimedByte, TimedUart};
use crate::{RtuSlaveConfig, SlaveError, BROADCAST_ADDRESS};
use ferrobus_core::encoding::Writer;
use ferrobus_core::frame::rtu;
use ferrobus_core::pdu::TargetType;
use ferrobus_core::DecodeError;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Address byte + largest PDU + CRC.
const MAX_ADU_LEN: usize = 1 + rtu::MAX_PDU_LEN + 2;

/// A Modbus RTU slave bound to one half-duplex serial line.
pub struct RtuSlave<U, R> {
    uart: U,
    rts: R,
    registry: HandlerRegistry,
    slave_id: u8,
    gap_threshold: Duration,
    buffer: Vec<u8>,
    parsing: bool,
}

impl RtuSlave<SerialTimedUart, NoRts> {
    /// Open a serial port with the configured line settings. Use
    /// [`RtuSlave::new`] for a custom UART or an explicit RTS pin.
    pub fn open(path: &str, config: RtuSlaveConfig) -> Result<Self, SlaveError> {
        let uart = SerialTimedUart::open(path, &config)?;
        Ok(Self::new(uart, NoRts, config))
    }
}

impl<U: TimedUart, R: RtsPin> RtuSlave<U, R> {
    pub fn new(uart: U, rts: R, config: RtuSlaveConfig) -> Self {
        Self {
            uart,
            rts,
            registry: HandlerRegistry::new(),
            slave_id: config.slave_id,
            gap_threshold: config.frame_gap.threshold(config.baud_rate),
            buffer: Vec::with_capacity(MAX_ADU_LEN),
            parsing: true,
        }
    }

    /// Change this slave's own address. Takes effect for the next frame.
    pub fn set_slave_id(&mut self, slave_id: u8) {
        self.slave_id = slave_id;
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    /// Direct access to the handler registry, for bulk installation.
    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub fn on_read(&mut self, target: TargetType, handler: ReadHandler) -> &mut Self {
        self.registry.on_read(target, handler);
        self
    }

    pub fn on_write(&mut self, target: TargetType, handler: WriteHandler) -> &mut Self {
        self.registry.on_write(target, handler);
        self
    }

    pub fn on_read_exception_status(&mut self, handler: ExceptionStatusHandler) -> &mut Self {
        self.registry.on_read_exception_status(handler);
        self
    }

    pub fn on_diagnostics(&mut self, handler: DiagnosticsHandler) -> &mut Self {
        self.registry.on_diagnostics(handler);
        self
    }

    pub fn on_report_slave_id(&mut self, handler: ReportSlaveIdHandler) -> &mut Self {
        self.registry.on_report_slave_id(handler);
        self
    }

    pub fn on_read_device_identification(
        &mut self,
        handler: DeviceIdentificationHandler,
    ) -> &mut Self {
        self.registry.on_read_device_identification(handler);
        self
    }

    pub fn on_error(&mut self, handler: ErrorHandler) -> &mut Self {
        self.registry.on_error(handler);
        self
    }

    /// Serve requests until the UART closes or fails.
    pub async fn run(mut self) -> Result<(), SlaveError> {
        loop {
            let Some(timed) = self.uart.recv().await? else {
                trace!("uart closed, slave run loop ending");
                return Ok(());
            };
            self.accept_byte(timed).await?;
        }
    }

    async fn accept_byte(&mut self, timed: TimedByte) -> Result<(), SlaveError> {
        let starts_frame = timed.gap > self.gap_threshold;
        if starts_frame {
            self.buffer.clear();
            self.parsing = true;
        } else if self.buffer.is_empty() && timed.byte == 0x00 {
            // Idle-line noise: zero bytes without a frame gap in front.
            trace!("discarding idle-line zero byte");
            return Ok(());
        }

        if !self.parsing {
            return Ok(());
        }

        if self.buffer.len() == MAX_ADU_LEN {
            self.buffer.clear();
            self.parsing = false;
            warn!("receive buffer overflow, ignoring line until next gap");
            self.registry.emit_error(&SlaveError::FrameTooLong);
            return Ok(());
        }
        self.buffer.push(timed.byte);

        if self.buffer.len() == 1 {
            let address = self.buffer[0];
            let for_us = self.slave_id == BROADCAST_ADDRESS
                || address == self.slave_id
                || address == BROADCAST_ADDRESS;
            if !for_us {
                trace!(address, "frame addressed elsewhere, ignoring until next gap");
                self.buffer.clear();
                self.parsing = false;
                return Ok(());
            }
        }

        if self.buffer.len() < rtu::MIN_ADU_LEN {
            return Ok(());
        }

        let expected_pdu_len = match rtu::request_pdu_len(&self.buffer[1..]) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(()),
            Err(_) => {
                let function = self.buffer[1];
                self.buffer.clear();
                self.parsing = false;
                warn!(function, "unrecognized function code, ignoring until next gap");
                self.registry.emit_error(&SlaveError::UnknownFunction(function));
                return Ok(());
            }
        };

        // Address + PDU + CRC.
        if self.buffer.len() < expected_pdu_len + 3 {
            return Ok(());
        }

        let frame = std::mem::take(&mut self.buffer);
        match rtu::decode_frame(&frame) {
            Ok((address, request_pdu)) => {
                debug!(
                    address,
                    function = request_pdu[0],
                    adu_len = frame.len(),
                    "rtu request received"
                );
                let response_pdu = dispatch(&mut self.registry, request_pdu);
                // Broadcasts act but stay silent.
                if address != BROADCAST_ADDRESS {
                    self.transmit(address, &response_pdu).await?;
                }
            }
            Err(DecodeError::InvalidCrc) => {
                // Corrupt frames get no wire response.
                self.parsing = false;
                warn!("frame failed crc check, dropped");
                self.registry.emit_error(&SlaveError::InvalidCrc);
            }
            Err(err) => {
                self.parsing = false;
                self.registry.emit_error(&SlaveError::Decode(err));
            }
        }
        Ok(())
    }

    /// Half-duplex transmit: assert RTS, write, flush, deassert.
    async fn transmit(&mut self, address: u8, pdu: &[u8]) -> Result<(), SlaveError> {
        let mut frame = vec![0u8; pdu.len() + 3];
        let mut w = Writer::new(&mut frame);
        rtu::encode_frame(&mut w, address, pdu)?;

        self.rts.set_active(true);
        let sent = async {
            self.uart.send(w.written()).await?;
            self.uart.flush().await
        }
        .await;
        self.rts.set_active(false);
        sent?;

        debug!(address, pdu_len = pdu.len(), "rtu response sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RtuSlave;
    use crate::uart::{RtsPin, TimedByte, TimedUart};
    use crate::{FrameGap, RtuSlaveConfig, SlaveError};
    use async_trait::async_trait;
    use ferrobus_core::encoding::Writer;
    use ferrobus_core::frame::rtu;
    use ferrobus_core::pdu::{PointValues, TargetType};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct MockUart {
        incoming: VecDeque<TimedByte>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        events: EventLog,
    }

    #[async_trait]
    impl TimedUart for MockUart {
        async fn recv(&mut self) -> std::io::Result<Option<TimedByte>> {
            Ok(self.incoming.pop_front())
        }

        async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.events.lock().unwrap().push("write".into());
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        async fn flush(&mut self) -> std::io::Result<()> {
            self.events.lock().unwrap().push("flush".into());
            Ok(())
        }
    }

    struct MockRts {
        events: EventLog,
    }

    impl RtsPin for MockRts {
        fn set_active(&mut self, active: bool) {
            self.events
                .lock()
                .unwrap()
                .push(if active { "rts-high".into() } else { "rts-low".into() });
        }
    }

    struct Fixture {
        incoming: VecDeque<TimedByte>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        events: EventLog,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                incoming: VecDeque::new(),
                sent: Arc::new(Mutex::new(Vec::new())),
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Queue a framed request: a frame gap before the first byte,
        /// tight spacing within.
        fn push_frame(&mut self, address: u8, pdu: &[u8]) {
            self.push_frame_with_gaps(address, pdu, Duration::from_millis(5), Duration::from_micros(100));
        }

        fn push_frame_with_gaps(
            &mut self,
            address: u8,
            pdu: &[u8],
            leading_gap: Duration,
            intra_gap: Duration,
        ) {
            let mut frame = vec![0u8; pdu.len() + 3];
            let mut w = Writer::new(&mut frame);
            rtu::encode_frame(&mut w, address, pdu).unwrap();
            for (index, &byte) in w.written().iter().enumerate() {
                let gap = if index == 0 { leading_gap } else { intra_gap };
                self.incoming.push_back(TimedByte::new(gap, byte));
            }
        }

        fn push_raw(&mut self, gap: Duration, byte: u8) {
            self.incoming.push_back(TimedByte::new(gap, byte));
        }

        fn slave(self, config: RtuSlaveConfig) -> RtuSlave<MockUart, MockRts> {
            let uart = MockUart {
                incoming: self.incoming,
                sent: Arc::clone(&self.sent),
                events: Arc::clone(&self.events),
            };
            let rts = MockRts {
                events: Arc::clone(&self.events),
            };
            RtuSlave::new(uart, rts, config)
        }
    }

    fn config() -> RtuSlaveConfig {
        // Conservative gap at 19200 baud: threshold ~2343 us.
        RtuSlaveConfig::new(0x01).with_frame_gap(FrameGap::Conservative)
    }

    fn install_echo_registers<U: TimedUart, R: RtsPin>(slave: &mut RtuSlave<U, R>) {
        slave.on_read(
            TargetType::HoldingRegister,
            Box::new(|start, quantity| {
                Ok(PointValues::Words(
                    (start..start + quantity).collect(),
                ))
            }),
        );
    }

    fn expected_response(address: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; pdu.len() + 3];
        let mut w = Writer::new(&mut frame);
        rtu::encode_frame(&mut w, address, pdu).unwrap();
        w.written().to_vec()
    }

    #[tokio::test]
    async fn serves_a_read_request() {
        let mut fixture = Fixture::new();
        fixture.push_frame(0x01, &[0x03, 0x00, 0x05, 0x00, 0x02]);
        let sent = Arc::clone(&fixture.sent);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.run().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            expected_response(0x01, &[0x03, 0x04, 0x00, 0x05, 0x00, 0x06])
        );
    }

    #[tokio::test]
    async fn gap_splits_two_back_to_back_frames() {
        // Two frames whose bytes are tightly spaced, separated only by a
        // gap above the threshold; both must parse.
        let mut fixture = Fixture::new();
        fixture.push_frame_with_gaps(
            0x01,
            &[0x03, 0x00, 0x00, 0x00, 0x01],
            Duration::from_micros(5000),
            Duration::from_micros(1000),
        );
        fixture.push_frame_with_gaps(
            0x01,
            &[0x03, 0x00, 0x01, 0x00, 0x01],
            Duration::from_micros(3000),
            Duration::from_micros(1000),
        );
        let sent = Arc::clone(&fixture.sent);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.run().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            expected_response(0x01, &[0x03, 0x02, 0x00, 0x00])
        );
        assert_eq!(
            sent[1],
            expected_response(0x01, &[0x03, 0x02, 0x00, 0x01])
        );
    }

    #[tokio::test]
    async fn mid_frame_gap_restarts_the_frame() {
        let mut fixture = Fixture::new();
        // A valid frame torn apart by silence after three bytes: neither
        // half may produce a response, and the following frame must.
        let mut torn = vec![0u8; 8];
        let mut w = Writer::new(&mut torn);
        rtu::encode_frame(&mut w, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
        for (index, &byte) in w.written().iter().enumerate() {
            let gap = match index {
                0 => Duration::from_millis(5),
                3 => Duration::from_millis(5),
                _ => Duration::from_micros(200),
            };
            fixture.push_raw(gap, byte);
        }
        fixture.push_frame(0x01, &[0x03, 0x00, 0x07, 0x00, 0x01]);
        let sent = Arc::clone(&fixture.sent);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.run().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            expected_response(0x01, &[0x03, 0x02, 0x00, 0x07])
        );
    }

    #[tokio::test]
    async fn frames_for_other_slaves_are_ignored() {
        let mut fixture = Fixture::new();
        fixture.push_frame(0x17, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        fixture.push_frame(0x01, &[0x03, 0x00, 0x02, 0x00, 0x01]);
        let sent = Arc::clone(&fixture.sent);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.run().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            expected_response(0x01, &[0x03, 0x02, 0x00, 0x02])
        );
    }

    #[tokio::test]
    async fn corrupted_crc_is_silent_but_reported() {
        let mut fixture = Fixture::new();
        let mut frame = vec![0u8; 8];
        let mut w = Writer::new(&mut frame);
        rtu::encode_frame(&mut w, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
        let mut bytes = w.written().to_vec();
        bytes[2] ^= 0x01;
        for (index, &byte) in bytes.iter().enumerate() {
            let gap = if index == 0 {
                Duration::from_millis(5)
            } else {
                Duration::from_micros(100)
            };
            fixture.push_raw(gap, byte);
        }
        let sent = Arc::clone(&fixture.sent);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_in_hook = Arc::clone(&errors);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.on_error(Box::new(move |err| {
            errors_in_hook.lock().unwrap().push(err.to_string());
        }));
        slave.run().await.unwrap();

        assert!(sent.lock().unwrap().is_empty());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("crc"));
    }

    #[tokio::test]
    async fn broadcast_writes_act_without_responding() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let written_in_handler = Arc::clone(&written);

        let mut fixture = Fixture::new();
        fixture.push_frame(0x00, &[0x06, 0x00, 0x01, 0x12, 0x34]);
        let sent = Arc::clone(&fixture.sent);

        let mut slave = fixture.slave(config());
        slave.on_write(
            TargetType::HoldingRegister,
            Box::new(move |address, values| {
                written_in_handler
                    .lock()
                    .unwrap()
                    .push((address, values.clone()));
                Ok(())
            }),
        );
        slave.run().await.unwrap();

        assert!(sent.lock().unwrap().is_empty());
        let written = written.lock().unwrap();
        assert_eq!(
            written.as_slice(),
            &[(0x0001, PointValues::Words(vec![0x1234]))]
        );
    }

    #[tokio::test]
    async fn idle_line_zero_bytes_are_discarded() {
        let mut fixture = Fixture::new();
        // Noise zeros with sub-threshold gaps; no frame gap in front.
        fixture.push_raw(Duration::from_micros(50), 0x00);
        fixture.push_raw(Duration::from_micros(50), 0x00);
        fixture.push_frame(0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        let sent = Arc::clone(&fixture.sent);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.run().await.unwrap();

        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_function_is_reported_and_line_ignored_until_gap() {
        let mut fixture = Fixture::new();
        fixture.push_raw(Duration::from_millis(5), 0x01);
        fixture.push_raw(Duration::from_micros(100), 0x42);
        fixture.push_raw(Duration::from_micros(100), 0x00);
        fixture.push_raw(Duration::from_micros(100), 0x00);
        fixture.push_frame(0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        let sent = Arc::clone(&fixture.sent);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_in_hook = Arc::clone(&errors);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.on_error(Box::new(move |err| {
            errors_in_hook.lock().unwrap().push(err.to_string());
        }));
        slave.run().await.unwrap();

        assert_eq!(sent.lock().unwrap().len(), 1);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("0x42"));
    }

    #[tokio::test]
    async fn rts_brackets_the_transmit_sequence() {
        let mut fixture = Fixture::new();
        fixture.push_frame(0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        let events = Arc::clone(&fixture.events);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.run().await.unwrap();

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &["rts-high", "write", "flush", "rts-low"]
        );
    }

    #[tokio::test]
    async fn set_slave_id_changes_filtering() {
        let mut fixture = Fixture::new();
        fixture.push_frame(0x05, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        let sent = Arc::clone(&fixture.sent);

        let mut slave = fixture.slave(config());
        install_echo_registers(&mut slave);
        slave.set_slave_id(0x05);
        slave.run().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], 0x05);
    }

    #[tokio::test]
    async fn uart_error_ends_the_run_loop() {
        struct FailingUart;

        #[async_trait]
        impl TimedUart for FailingUart {
            async fn recv(&mut self) -> std::io::Result<Option<TimedByte>> {
                Err(std::io::Error::other("uart gone"))
            }
            async fn send(&mut self, _frame: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
            async fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        struct SilentRts;
        impl RtsPin for SilentRts {
            fn set_active(&mut self, _active: bool) {}
        }

        let slave = RtuSlave::new(FailingUart, SilentRts, config());
        assert!(matches!(slave.run().await, Err(SlaveError::Io(_))));
    }
}
