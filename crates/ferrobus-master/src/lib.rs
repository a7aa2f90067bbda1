//! Async Modbus TCP master.
//!
//! A [`Master`] owns one MBAP connection and multiplexes requests over it
//! through a pending-transaction table: every request claims a transaction
//! id, and a background receive task pairs incoming ADUs back to their
//! waiting callers, so responses may complete out of request order. Lost
//! connections are redialed transparently until [`Master::disconnect`].

#![forbid(unsafe_code)]

pub mod value;

mod table;

pub use value::WriteValue;

use value::{plan_coil_write, plan_register_write, CoilWrite, RegisterWrite};

use ferrobus_core::encoding::{Reader, Writer};
use ferrobus_core::frame::tcp;
use ferrobus_core::pdu::{
    points, DiagnosticsRequest, ExceptionResponse, FunctionCode, MaskWriteRegisterRequest,
    PointValues, ReadDeviceIdentificationRequest, ReadRequest, ReadWriteMultipleRegistersRequest,
    Request, Response, TargetType, WriteMultipleCoilsRequest, WriteMultipleRegistersRequest,
    WriteSingleCoilRequest, WriteSingleRegisterRequest,
};
use ferrobus_core::{DecodeError, EncodeError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use table::TransactionTable;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// No response arrived within the configured response timeout.
    #[error("response timed out")]
    ResponseTimeout,
    /// The connection is down (or `disconnect` was called) and the
    /// request cannot complete.
    #[error("not connected")]
    Disconnected,
    /// The slave answered with a Modbus exception.
    #[error("modbus exception: {0}")]
    Exception(ExceptionResponse),
    /// All 255 transaction slots are occupied.
    #[error("too many outstanding requests (255 in flight)")]
    TooManyRequests,
    #[error("target {0:?} is read-only")]
    ReadOnlyTarget(TargetType),
    #[error("invalid quantity {0}")]
    InvalidQuantity(u16),
    /// The write value variant does not fit the target point space.
    #[error("write value does not fit the target")]
    InvalidValues,
    #[error("argument length {got} does not match quantity (expected {expected})")]
    InvalidArgLength { expected: usize, got: usize },
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
}

/// Connection and timing knobs for a [`Master`].
#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    /// MBAP unit id sent with every request. Plain Modbus TCP targets
    /// ignore it, so it defaults to 0.
    pub unit_id: u8,
    pub response_timeout: Duration,
    /// Delay between redial attempts after the peer drops the connection.
    pub reconnect_delay: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            unit_id: 0,
            response_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(250),
        }
    }
}

impl MasterConfig {
    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }
}

/// FC 17 result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveIdInfo {
    pub slave_id: Vec<u8>,
    pub run_indicator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdObject {
    pub object_id: u8,
    pub value: Vec<u8>,
}

/// FC 43 / MEI 0x0E result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentification {
    pub read_device_id_code: u8,
    pub conformity_level: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub objects: Vec<DeviceIdObject>,
}

struct Shared {
    config: MasterConfig,
    /// Destination we dial and redial. Stored explicitly so reconnects
    /// always target the original peer.
    peer: SocketAddr,
    table: StdMutex<TransactionTable>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    should_retry: AtomicBool,
    late_responses: AtomicU64,
}

/// Async Modbus TCP master. Cheap to share: all operations take `&self`.
pub struct Master {
    shared: Arc<Shared>,
}

impl Master {
    /// Open a connection and spawn the receive task. The task keeps
    /// redialing `addr` whenever the peer drops the connection, until
    /// [`Self::disconnect`] clears the retry flag.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: MasterConfig,
    ) -> Result<Self, MasterError> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            config,
            peer,
            table: StdMutex::new(TransactionTable::new()),
            writer: Mutex::new(Some(write_half)),
            should_retry: AtomicBool::new(true),
            late_responses: AtomicU64::new(0),
        });

        tokio::spawn(receive_loop(Arc::clone(&shared), read_half));
        debug!(%peer, "modbus master connected");
        Ok(Self { shared })
    }

    /// Stop retrying, close the connection and fail every in-flight
    /// transaction with [`MasterError::Disconnected`]. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.should_retry.store(false, Ordering::SeqCst);
        if let Some(mut write_half) = self.shared.writer.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        self.table().fail_all(|| MasterError::Disconnected);
        debug!(peer = %self.shared.peer, "modbus master disconnected");
    }

    /// Whether a live connection is currently held. During a redial
    /// window this reports `false` and requests fail fast.
    pub async fn is_connected(&self) -> bool {
        self.shared.writer.lock().await.is_some()
    }

    pub fn config(&self) -> MasterConfig {
        self.shared.config
    }

    /// Responses that arrived after their transaction timed out and were
    /// dropped.
    pub fn late_response_count(&self) -> u64 {
        self.shared.late_responses.load(Ordering::Relaxed)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, TransactionTable> {
        self.shared
            .table
            .lock()
            .expect("transaction table lock poisoned")
    }

    /// Encode `request`, claim a transaction id, send the ADU and wait
    /// for the paired response PDU or the response timeout.
    async fn transact(
        &self,
        request: Request<'_>,
        quantity_hint: u16,
    ) -> Result<Vec<u8>, MasterError> {
        let expected = request.function_code();
        let mut pdu_buf = [0u8; tcp::MAX_PDU_LEN];
        let mut pdu_writer = Writer::new(&mut pdu_buf);
        request.encode(&mut pdu_writer)?;

        let (transaction_id, response_rx) = self.table().insert(expected, quantity_hint)?;

        let mut frame_buf = [0u8; tcp::MBAP_HEADER_LEN + tcp::MAX_PDU_LEN];
        let mut frame_writer = Writer::new(&mut frame_buf);
        tcp::encode_frame(
            &mut frame_writer,
            u16::from(transaction_id),
            self.shared.config.unit_id,
            pdu_writer.written(),
        )?;

        {
            let mut writer = self.shared.writer.lock().await;
            let Some(stream) = writer.as_mut() else {
                self.table().remove(transaction_id);
                return Err(MasterError::Disconnected);
            };
            if let Err(err) = stream.write_all(frame_writer.written()).await {
                self.table().remove(transaction_id);
                return Err(MasterError::Io(err));
            }
        }

        debug!(
            transaction_id,
            function = expected.as_u8(),
            pdu_len = pdu_writer.written().len(),
            "modbus request sent"
        );

        match timeout(self.shared.config.response_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MasterError::Disconnected),
            Err(_) => {
                // Release the slot so a late response finds nothing.
                self.table().remove(transaction_id);
                warn!(transaction_id, "modbus request timed out");
                Err(MasterError::ResponseTimeout)
            }
        }
    }

    /// Read `quantity` points starting at `start_address`. Returns bits
    /// for coil/discrete-input targets and words for register targets.
    pub async fn read(
        &self,
        target: TargetType,
        start_address: u16,
        quantity: u16,
    ) -> Result<PointValues, MasterError> {
        if quantity == 0 || quantity > ReadRequest::max_quantity(target) {
            return Err(MasterError::InvalidQuantity(quantity));
        }
        let request = ReadRequest {
            target,
            start_address,
            quantity,
        };
        let pdu = self.transact(Request::Read(request), quantity).await?;

        match decode_checked(&pdu)? {
            Response::ReadBits(resp) if resp.target == target => {
                if resp.data.len() != points::packed_bit_len(usize::from(quantity)) {
                    return Err(MasterError::InvalidResponse(
                        "bit payload does not match requested quantity",
                    ));
                }
                let bits = points::unpack_bits(resp.data, usize::from(quantity))
                    .ok_or(MasterError::InvalidResponse("bit payload truncated"))?;
                Ok(PointValues::Bits(bits))
            }
            Response::ReadWords(resp) if resp.target == target => {
                if resp.word_count() != usize::from(quantity) {
                    return Err(MasterError::InvalidResponse(
                        "word payload does not match requested quantity",
                    ));
                }
                let words = (0..usize::from(quantity))
                    .filter_map(|index| resp.word(index))
                    .collect();
                Ok(PointValues::Words(words))
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    /// Write `quantity` points starting at `start_address`, dispatching
    /// to the single or multiple write function by target, quantity and
    /// value variant.
    pub async fn write(
        &self,
        target: TargetType,
        start_address: u16,
        quantity: u16,
        value: WriteValue,
    ) -> Result<(), MasterError> {
        if !target.is_writable() {
            return Err(MasterError::ReadOnlyTarget(target));
        }
        if quantity == 0 {
            return Err(MasterError::InvalidQuantity(quantity));
        }

        match target {
            TargetType::Coil => match plan_coil_write(quantity, value)? {
                CoilWrite::Single(word) => {
                    self.write_single_coil_raw(start_address, word).await
                }
                CoilWrite::Multiple(bits) => {
                    self.write_multiple_coils(start_address, &bits).await
                }
            },
            TargetType::HoldingRegister => {
                match plan_register_write(quantity, value)? {
                    RegisterWrite::Single(word) => {
                        self.write_single_register(start_address, word).await
                    }
                    RegisterWrite::Multiple(words) => {
                        self.write_multiple_registers(start_address, &words).await
                    }
                }
            }
            TargetType::DiscreteInput | TargetType::InputRegister => {
                Err(MasterError::ReadOnlyTarget(target))
            }
        }
    }

    pub async fn read_coils(
        &self,
        start_address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, MasterError> {
        match self.read(TargetType::Coil, start_address, quantity).await? {
            PointValues::Bits(bits) => Ok(bits),
            PointValues::Words(_) => Err(MasterError::InvalidResponse("expected bits")),
        }
    }

    pub async fn read_discrete_inputs(
        &self,
        start_address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, MasterError> {
        match self
            .read(TargetType::DiscreteInput, start_address, quantity)
            .await?
        {
            PointValues::Bits(bits) => Ok(bits),
            PointValues::Words(_) => Err(MasterError::InvalidResponse("expected bits")),
        }
    }

    pub async fn read_holding_registers(
        &self,
        start_address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, MasterError> {
        match self
            .read(TargetType::HoldingRegister, start_address, quantity)
            .await?
        {
            PointValues::Words(words) => Ok(words),
            PointValues::Bits(_) => Err(MasterError::InvalidResponse("expected words")),
        }
    }

    pub async fn read_input_registers(
        &self,
        start_address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, MasterError> {
        match self
            .read(TargetType::InputRegister, start_address, quantity)
            .await?
        {
            PointValues::Words(words) => Ok(words),
            PointValues::Bits(_) => Err(MasterError::InvalidResponse("expected words")),
        }
    }

    pub async fn write_single_coil(
        &self,
        address: u16,
        on: bool,
    ) -> Result<(), MasterError> {
        let request = WriteSingleCoilRequest::from_bool(address, on);
        self.write_single_coil_raw(address, request.value).await
    }

    async fn write_single_coil_raw(&self, address: u16, value: u16) -> Result<(), MasterError> {
        let request = WriteSingleCoilRequest { address, value };
        let pdu = self.transact(Request::WriteSingleCoil(request), 1).await?;
        match decode_checked(&pdu)? {
            Response::WriteSingleCoil(resp)
                if resp.address == address && resp.value == value =>
            {
                Ok(())
            }
            Response::WriteSingleCoil(_) => {
                Err(MasterError::InvalidResponse("single coil echo mismatch"))
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    pub async fn write_single_register(
        &self,
        address: u16,
        word: u16,
    ) -> Result<(), MasterError> {
        let request = WriteSingleRegisterRequest {
            address,
            value: word,
        };
        let pdu = self
            .transact(Request::WriteSingleRegister(request), 1)
            .await?;
        match decode_checked(&pdu)? {
            Response::WriteSingleRegister(resp)
                if resp.address == address && resp.value == word =>
            {
                Ok(())
            }
            Response::WriteSingleRegister(_) => {
                Err(MasterError::InvalidResponse("single register echo mismatch"))
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    pub async fn write_multiple_coils(
        &self,
        start_address: u16,
        bits: &[bool],
    ) -> Result<(), MasterError> {
        let request = WriteMultipleCoilsRequest {
            start_address,
            values: bits,
        };
        let quantity = request.quantity()?;
        let pdu = self
            .transact(Request::WriteMultipleCoils(request), quantity)
            .await?;
        match decode_checked(&pdu)? {
            Response::WriteMultipleCoils(resp)
                if resp.start_address == start_address && resp.quantity == quantity =>
            {
                Ok(())
            }
            Response::WriteMultipleCoils(_) => {
                Err(MasterError::InvalidResponse("multiple coil echo mismatch"))
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    pub async fn write_multiple_registers(
        &self,
        start_address: u16,
        words: &[u16],
    ) -> Result<(), MasterError> {
        let request = WriteMultipleRegistersRequest {
            start_address,
            values: words,
        };
        let quantity = request.quantity()?;
        let pdu = self
            .transact(Request::WriteMultipleRegisters(request), quantity)
            .await?;
        match decode_checked(&pdu)? {
            Response::WriteMultipleRegisters(resp)
                if resp.start_address == start_address && resp.quantity == quantity =>
            {
                Ok(())
            }
            Response::WriteMultipleRegisters(_) => {
                Err(MasterError::InvalidResponse("multiple register echo mismatch"))
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    /// FC 7: read the eight exception-status coils as one byte.
    pub async fn read_exception_status(&self) -> Result<u8, MasterError> {
        let pdu = self.transact(Request::ReadExceptionStatus, 0).await?;
        match decode_checked(&pdu)? {
            Response::ReadExceptionStatus(resp) => Ok(resp.status),
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    /// FC 8: run a diagnostics sub-function and return the echoed data.
    pub async fn diagnostics(
        &self,
        sub_function: u16,
        data: &[u8],
    ) -> Result<Vec<u8>, MasterError> {
        let request = DiagnosticsRequest { sub_function, data };
        let pdu = self.transact(Request::Diagnostics(request), 0).await?;
        match decode_checked(&pdu)? {
            Response::Diagnostics(resp) if resp.sub_function == sub_function => {
                Ok(resp.data.to_vec())
            }
            Response::Diagnostics(_) => {
                Err(MasterError::InvalidResponse("diagnostics sub-function mismatch"))
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    /// FC 22: `register = (register & and_mask) | (or_mask & !and_mask)`.
    pub async fn mask_write_register(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), MasterError> {
        let request = MaskWriteRegisterRequest {
            address,
            and_mask,
            or_mask,
        };
        let pdu = self.transact(Request::MaskWriteRegister(request), 1).await?;
        match decode_checked(&pdu)? {
            Response::MaskWriteRegister(resp)
                if resp.address == address
                    && resp.and_mask == and_mask
                    && resp.or_mask == or_mask =>
            {
                Ok(())
            }
            Response::MaskWriteRegister(_) => {
                Err(MasterError::InvalidResponse("mask write echo mismatch"))
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    /// FC 23: write `values` then read `read_quantity` registers in one
    /// transaction.
    pub async fn read_write_multiple_registers(
        &self,
        read_start_address: u16,
        read_quantity: u16,
        write_start_address: u16,
        values: &[u16],
    ) -> Result<Vec<u16>, MasterError> {
        let request = ReadWriteMultipleRegistersRequest {
            read_start_address,
            read_quantity,
            write_start_address,
            values,
        };
        let pdu = self
            .transact(Request::ReadWriteMultipleRegisters(request), read_quantity)
            .await?;
        match decode_checked(&pdu)? {
            Response::ReadWriteMultipleRegisters(resp) => {
                if resp.word_count() != usize::from(read_quantity) {
                    return Err(MasterError::InvalidResponse(
                        "word payload does not match requested quantity",
                    ));
                }
                Ok((0..usize::from(read_quantity))
                    .filter_map(|index| resp.word(index))
                    .collect())
            }
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    /// FC 17.
    pub async fn report_slave_id(&self) -> Result<SlaveIdInfo, MasterError> {
        let pdu = self.transact(Request::ReportSlaveId, 0).await?;
        match decode_checked(&pdu)? {
            Response::ReportSlaveId(resp) => Ok(SlaveIdInfo {
                slave_id: resp.slave_id().to_vec(),
                run_indicator: resp.run_indicator(),
            }),
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }

    /// FC 43 / MEI 0x0E.
    pub async fn read_device_identification(
        &self,
        read_device_id_code: u8,
        object_id: u8,
    ) -> Result<DeviceIdentification, MasterError> {
        let request = ReadDeviceIdentificationRequest {
            read_device_id_code,
            object_id,
        };
        let pdu = self
            .transact(Request::ReadDeviceIdentification(request), 0)
            .await?;
        match decode_checked(&pdu)? {
            Response::ReadDeviceIdentification(resp) => Ok(DeviceIdentification {
                read_device_id_code: resp.read_device_id_code,
                conformity_level: resp.conformity_level,
                more_follows: resp.more_follows,
                next_object_id: resp.next_object_id,
                objects: resp
                    .objects()
                    .map(|(object_id, value)| DeviceIdObject {
                        object_id,
                        value: value.to_vec(),
                    })
                    .collect(),
            }),
            _ => Err(MasterError::InvalidResponse("unexpected function response")),
        }
    }
}

/// Decode a response PDU, mapping exception responses to errors and
/// rejecting trailing bytes.
fn decode_checked(pdu: &[u8]) -> Result<Response<'_>, MasterError> {
    let mut reader = Reader::new(pdu);
    let response = Response::decode(&mut reader)?;
    reader.finish()?;
    if let Response::Exception(exception) = response {
        return Err(MasterError::Exception(exception));
    }
    Ok(response)
}

/// Read exactly one MBAP-framed ADU off the stream.
async fn read_adu(reader: &mut OwnedReadHalf) -> Result<(tcp::MbapHeader, Vec<u8>), MasterError> {
    let mut header_buf = [0u8; tcp::MBAP_HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;

    let mut header_reader = Reader::new(&header_buf);
    let header = tcp::MbapHeader::decode(&mut header_reader)?;
    let pdu_len = header.pdu_len();
    if pdu_len == 0 || pdu_len > tcp::MAX_PDU_LEN {
        return Err(MasterError::InvalidResponse("mbap length out of range"));
    }

    let mut pdu = vec![0u8; pdu_len];
    reader.read_exact(&mut pdu).await?;
    Ok((header, pdu))
}

/// Pair one received ADU with its pending transaction.
fn deliver(shared: &Shared, header: tcp::MbapHeader, pdu: Vec<u8>) {
    let transaction_id = header.transaction_id;
    if transaction_id == 0 || transaction_id > u16::from(u8::MAX) {
        warn!(transaction_id, "response with out-of-range transaction id dropped");
        return;
    }

    let pending = shared
        .table
        .lock()
        .expect("transaction table lock poisoned")
        .remove(transaction_id as u8);
    let Some(pending) = pending else {
        shared.late_responses.fetch_add(1, Ordering::Relaxed);
        trace!(transaction_id, "late or unknown response dropped");
        return;
    };

    let expected = pending.expected_function.as_u8();
    let function_matches = pdu
        .first()
        .is_some_and(|&fc| fc == expected || fc == (expected | 0x80));

    debug!(
        transaction_id,
        function = expected,
        quantity = pending.quantity,
        pdu_len = pdu.len(),
        "modbus response received"
    );

    let result = if function_matches {
        Ok(pdu)
    } else {
        Err(MasterError::InvalidResponse("response function mismatch"))
    };
    let _ = pending.complete.send(result);
}

/// Background receive task: pairs responses until the connection drops,
/// then fails in-flight transactions and redials unless `disconnect`
/// cleared the retry flag.
async fn receive_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    loop {
        match read_adu(&mut reader).await {
            Ok((header, pdu)) => deliver(&shared, header, pdu),
            Err(err) => {
                shared.writer.lock().await.take();
                shared
                    .table
                    .lock()
                    .expect("transaction table lock poisoned")
                    .fail_all(|| MasterError::Disconnected);

                if !shared.should_retry.load(Ordering::SeqCst) {
                    trace!("receive loop stopped after disconnect");
                    return;
                }

                warn!(peer = %shared.peer, error = %err, "connection lost, redialing");
                match redial(&shared).await {
                    Some(new_reader) => reader = new_reader,
                    None => return,
                }
            }
        }
    }
}

async fn redial(shared: &Shared) -> Option<OwnedReadHalf> {
    loop {
        if !shared.should_retry.load(Ordering::SeqCst) {
            return None;
        }
        sleep(shared.config.reconnect_delay).await;

        match TcpStream::connect(shared.peer).await {
            Ok(stream) => {
                // A disconnect may have landed while we were dialing.
                if !shared.should_retry.load(Ordering::SeqCst) {
                    return None;
                }
                let (read_half, write_half) = stream.into_split();
                *shared.writer.lock().await = Some(write_half);
                debug!(peer = %shared.peer, "reconnected");
                return Some(read_half);
            }
            Err(err) => {
                trace!(peer = %shared.peer, error = %err, "redial attempt failed");
            }
        }
    }
}
