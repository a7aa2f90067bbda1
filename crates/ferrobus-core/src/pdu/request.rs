use crate::encoding::{Reader, Writer};
use crate::pdu::function_code::MEI_READ_DEVICE_ID;
use crate::pdu::points::{self, TargetType};
use crate::pdu::FunctionCode;
use crate::{DecodeError, EncodeError};

/// Quantity ceilings fixed by the Modbus application protocol.
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_WORDS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_WORDS: u16 = 123;
pub const MAX_RW_WRITE_WORDS: u16 = 121;

/// Wire encodings of a single-coil write value.
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

fn check_quantity(quantity: u16, max: u16) -> Result<(), EncodeError> {
    if quantity == 0 || quantity > max {
        return Err(EncodeError::ValueOutOfRange);
    }
    Ok(())
}

fn check_quantity_decode(quantity: u16, max: u16) -> Result<(), DecodeError> {
    if quantity == 0 || quantity > max {
        return Err(DecodeError::InvalidValue);
    }
    Ok(())
}

/// The addressed range must stay inside the 16-bit point space.
fn span_fits(start: u16, quantity: u16) -> bool {
    usize::from(start) + usize::from(quantity) <= 0x1_0000
}

/// Read request for any of the four point spaces (FC 1, 2, 3 or 4,
/// selected by `target`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadRequest {
    pub target: TargetType,
    pub start_address: u16,
    pub quantity: u16,
}

impl ReadRequest {
    pub const fn max_quantity(target: TargetType) -> u16 {
        if target.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_WORDS
        }
    }

    /// Payload byte count of the matching well-formed response.
    pub fn response_data_len(&self) -> usize {
        if self.target.is_bit() {
            points::packed_bit_len(usize::from(self.quantity))
        } else {
            usize::from(self.quantity) * 2
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        check_quantity(self.quantity, Self::max_quantity(self.target))?;
        if !span_fits(self.start_address, self.quantity) {
            return Err(EncodeError::ValueOutOfRange);
        }
        w.write_u8(self.target.read_function().as_u8())?;
        w.write_u16(self.start_address)?;
        w.write_u16(self.quantity)?;
        Ok(())
    }

    fn decode_body(target: TargetType, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let start_address = r.read_u16()?;
        let quantity = r.read_u16()?;
        check_quantity_decode(quantity, Self::max_quantity(target))?;
        if !span_fits(start_address, quantity) {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            target,
            start_address,
            quantity,
        })
    }
}

/// FC 5. `value` is the raw wire word; only [`COIL_ON`] and [`COIL_OFF`]
/// are meaningful, but the encoder passes other words through untouched
/// (the peer rejects them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteSingleCoilRequest {
    pub address: u16,
    pub value: u16,
}

impl WriteSingleCoilRequest {
    pub const fn from_bool(address: u16, on: bool) -> Self {
        Self {
            address,
            value: if on { COIL_ON } else { COIL_OFF },
        }
    }

    pub const fn is_on(&self) -> bool {
        self.value == COIL_ON
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::WriteSingleCoil.as_u8())?;
        w.write_u16(self.address)?;
        w.write_u16(self.value)?;
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let address = r.read_u16()?;
        let value = r.read_u16()?;
        if value != COIL_ON && value != COIL_OFF {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self { address, value })
    }
}

/// FC 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteSingleRegisterRequest {
    pub address: u16,
    pub value: u16,
}

impl WriteSingleRegisterRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::WriteSingleRegister.as_u8())?;
        w.write_u16(self.address)?;
        w.write_u16(self.value)?;
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            address: r.read_u16()?,
            value: r.read_u16()?,
        })
    }
}

/// FC 15 encoder over a bool slice. Bits pack LSB-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleCoilsRequest<'a> {
    pub start_address: u16,
    pub values: &'a [bool],
}

impl<'a> WriteMultipleCoilsRequest<'a> {
    pub fn quantity(&self) -> Result<u16, EncodeError> {
        let quantity: u16 = self
            .values
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        check_quantity(quantity, MAX_WRITE_BITS)?;
        Ok(quantity)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let quantity = self.quantity()?;
        if !span_fits(self.start_address, quantity) {
            return Err(EncodeError::ValueOutOfRange);
        }
        let byte_count = points::packed_bit_len(self.values.len());

        w.write_u8(FunctionCode::WriteMultipleCoils.as_u8())?;
        w.write_u16(self.start_address)?;
        w.write_u16(quantity)?;
        w.write_u8(byte_count as u8)?;

        let mut packed = [0u8; points::packed_bit_len(MAX_WRITE_BITS as usize)];
        points::pack_bits(self.values, &mut packed[..byte_count]);
        w.write_bytes(&packed[..byte_count])?;
        Ok(())
    }
}

/// FC 16 encoder over a word slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleRegistersRequest<'a> {
    pub start_address: u16,
    pub values: &'a [u16],
}

impl<'a> WriteMultipleRegistersRequest<'a> {
    pub fn quantity(&self) -> Result<u16, EncodeError> {
        let quantity: u16 = self
            .values
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        check_quantity(quantity, MAX_WRITE_WORDS)?;
        Ok(quantity)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let quantity = self.quantity()?;
        if !span_fits(self.start_address, quantity) {
            return Err(EncodeError::ValueOutOfRange);
        }
        w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
        w.write_u16(self.start_address)?;
        w.write_u16(quantity)?;
        w.write_u8((self.values.len() * 2) as u8)?;
        for value in self.values {
            w.write_u16(*value)?;
        }
        Ok(())
    }
}

/// FC 8. `data` travels verbatim behind the sub-function word;
/// sub-function 0x0000 is the return-query-data loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsRequest<'a> {
    pub sub_function: u16,
    pub data: &'a [u8],
}

/// Diagnostics sub-function 0x0000: echo the request data.
pub const DIAG_RETURN_QUERY_DATA: u16 = 0x0000;

impl<'a> DiagnosticsRequest<'a> {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::Diagnostics.as_u8())?;
        w.write_u16(self.sub_function)?;
        w.write_bytes(self.data)?;
        Ok(())
    }

    fn decode_body(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(Self {
            sub_function: r.read_u16()?,
            data: r.read_rest(),
        })
    }
}

/// FC 22.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MaskWriteRegisterRequest {
    pub address: u16,
    pub and_mask: u16,
    pub or_mask: u16,
}

impl MaskWriteRegisterRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::MaskWriteRegister.as_u8())?;
        w.write_u16(self.address)?;
        w.write_u16(self.and_mask)?;
        w.write_u16(self.or_mask)?;
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            address: r.read_u16()?,
            and_mask: r.read_u16()?,
            or_mask: r.read_u16()?,
        })
    }
}

/// FC 23 encoder: one transaction that writes `values` then reads
/// `read_quantity` registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWriteMultipleRegistersRequest<'a> {
    pub read_start_address: u16,
    pub read_quantity: u16,
    pub write_start_address: u16,
    pub values: &'a [u16],
}

impl<'a> ReadWriteMultipleRegistersRequest<'a> {
    pub fn write_quantity(&self) -> Result<u16, EncodeError> {
        let quantity: u16 = self
            .values
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        check_quantity(quantity, MAX_RW_WRITE_WORDS)?;
        Ok(quantity)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        check_quantity(self.read_quantity, MAX_READ_WORDS)?;
        if !span_fits(self.read_start_address, self.read_quantity) {
            return Err(EncodeError::ValueOutOfRange);
        }
        let write_quantity = self.write_quantity()?;
        if !span_fits(self.write_start_address, write_quantity) {
            return Err(EncodeError::ValueOutOfRange);
        }

        w.write_u8(FunctionCode::ReadWriteMultipleRegisters.as_u8())?;
        w.write_u16(self.read_start_address)?;
        w.write_u16(self.read_quantity)?;
        w.write_u16(self.write_start_address)?;
        w.write_u16(write_quantity)?;
        w.write_u8((self.values.len() * 2) as u8)?;
        for value in self.values {
            w.write_u16(*value)?;
        }
        Ok(())
    }
}

/// FC 43 / MEI 0x0E.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadDeviceIdentificationRequest {
    /// 1 = basic, 2 = regular, 3 = extended, 4 = one specific object.
    pub read_device_id_code: u8,
    pub object_id: u8,
}

impl ReadDeviceIdentificationRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.read_device_id_code == 0 || self.read_device_id_code > 4 {
            return Err(EncodeError::ValueOutOfRange);
        }
        w.write_u8(FunctionCode::ReadDeviceIdentification.as_u8())?;
        w.write_u8(MEI_READ_DEVICE_ID)?;
        w.write_u8(self.read_device_id_code)?;
        w.write_u8(self.object_id)?;
        Ok(())
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if r.read_u8()? != MEI_READ_DEVICE_ID {
            return Err(DecodeError::InvalidValue);
        }
        let read_device_id_code = r.read_u8()?;
        if read_device_id_code == 0 || read_device_id_code > 4 {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            read_device_id_code,
            object_id: r.read_u8()?,
        })
    }
}

/// Every request this engine can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Read(ReadRequest),
    WriteSingleCoil(WriteSingleCoilRequest),
    WriteSingleRegister(WriteSingleRegisterRequest),
    WriteMultipleCoils(WriteMultipleCoilsRequest<'a>),
    WriteMultipleRegisters(WriteMultipleRegistersRequest<'a>),
    ReadExceptionStatus,
    Diagnostics(DiagnosticsRequest<'a>),
    ReportSlaveId,
    MaskWriteRegister(MaskWriteRegisterRequest),
    ReadWriteMultipleRegisters(ReadWriteMultipleRegistersRequest<'a>),
    ReadDeviceIdentification(ReadDeviceIdentificationRequest),
}

impl<'a> Request<'a> {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::Read(req) => req.target.read_function(),
            Self::WriteSingleCoil(_) => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister(_) => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils(_) => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters(_) => FunctionCode::WriteMultipleRegisters,
            Self::ReadExceptionStatus => FunctionCode::ReadExceptionStatus,
            Self::Diagnostics(_) => FunctionCode::Diagnostics,
            Self::ReportSlaveId => FunctionCode::ReportSlaveId,
            Self::MaskWriteRegister(_) => FunctionCode::MaskWriteRegister,
            Self::ReadWriteMultipleRegisters(_) => FunctionCode::ReadWriteMultipleRegisters,
            Self::ReadDeviceIdentification(_) => FunctionCode::ReadDeviceIdentification,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::Read(req) => req.encode(w),
            Self::WriteSingleCoil(req) => req.encode(w),
            Self::WriteSingleRegister(req) => req.encode(w),
            Self::WriteMultipleCoils(req) => req.encode(w),
            Self::WriteMultipleRegisters(req) => req.encode(w),
            Self::ReadExceptionStatus => w.write_u8(FunctionCode::ReadExceptionStatus.as_u8()),
            Self::Diagnostics(req) => req.encode(w),
            Self::ReportSlaveId => w.write_u8(FunctionCode::ReportSlaveId.as_u8()),
            Self::MaskWriteRegister(req) => req.encode(w),
            Self::ReadWriteMultipleRegisters(req) => req.encode(w),
            Self::ReadDeviceIdentification(req) => req.encode(w),
        }
    }
}

/// Borrowed FC 15 payload as decoded by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleCoilsData<'a> {
    pub start_address: u16,
    pub quantity: u16,
    pub packed: &'a [u8],
}

impl<'a> WriteMultipleCoilsData<'a> {
    pub fn bit(&self, index: usize) -> Option<bool> {
        if index >= usize::from(self.quantity) {
            return None;
        }
        points::bit_at(self.packed, index)
    }
}

/// Borrowed FC 16 payload as decoded by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleRegistersData<'a> {
    pub start_address: u16,
    pub data: &'a [u8],
}

impl<'a> WriteMultipleRegistersData<'a> {
    pub fn quantity(&self) -> usize {
        self.data.len() / 2
    }

    pub fn word(&self, index: usize) -> Option<u16> {
        let offset = index.checked_mul(2)?;
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// Borrowed FC 23 payload as decoded by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWriteMultipleRegistersData<'a> {
    pub read_start_address: u16,
    pub read_quantity: u16,
    pub write_start_address: u16,
    pub data: &'a [u8],
}

impl<'a> ReadWriteMultipleRegistersData<'a> {
    pub fn write_quantity(&self) -> usize {
        self.data.len() / 2
    }

    pub fn word(&self, index: usize) -> Option<u16> {
        let offset = index.checked_mul(2)?;
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// A request PDU as parsed by a slave, with packed payloads left borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedRequest<'a> {
    Read(ReadRequest),
    WriteSingleCoil(WriteSingleCoilRequest),
    WriteSingleRegister(WriteSingleRegisterRequest),
    WriteMultipleCoils(WriteMultipleCoilsData<'a>),
    WriteMultipleRegisters(WriteMultipleRegistersData<'a>),
    ReadExceptionStatus,
    Diagnostics(DiagnosticsRequest<'a>),
    ReportSlaveId,
    MaskWriteRegister(MaskWriteRegisterRequest),
    ReadWriteMultipleRegisters(ReadWriteMultipleRegistersData<'a>),
    ReadDeviceIdentification(ReadDeviceIdentificationRequest),
}

impl<'a> DecodedRequest<'a> {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::Read(req) => req.target.read_function(),
            Self::WriteSingleCoil(_) => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister(_) => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils(_) => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters(_) => FunctionCode::WriteMultipleRegisters,
            Self::ReadExceptionStatus => FunctionCode::ReadExceptionStatus,
            Self::Diagnostics(_) => FunctionCode::Diagnostics,
            Self::ReportSlaveId => FunctionCode::ReportSlaveId,
            Self::MaskWriteRegister(_) => FunctionCode::MaskWriteRegister,
            Self::ReadWriteMultipleRegisters(_) => FunctionCode::ReadWriteMultipleRegisters,
            Self::ReadDeviceIdentification(_) => FunctionCode::ReadDeviceIdentification,
        }
    }

    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function = FunctionCode::from_u8(r.read_u8()?)?;
        match function {
            FunctionCode::ReadCoils => Ok(Self::Read(ReadRequest::decode_body(
                TargetType::Coil,
                r,
            )?)),
            FunctionCode::ReadDiscreteInputs => Ok(Self::Read(ReadRequest::decode_body(
                TargetType::DiscreteInput,
                r,
            )?)),
            FunctionCode::ReadHoldingRegisters => Ok(Self::Read(ReadRequest::decode_body(
                TargetType::HoldingRegister,
                r,
            )?)),
            FunctionCode::ReadInputRegisters => Ok(Self::Read(ReadRequest::decode_body(
                TargetType::InputRegister,
                r,
            )?)),
            FunctionCode::WriteSingleCoil => Ok(Self::WriteSingleCoil(
                WriteSingleCoilRequest::decode_body(r)?,
            )),
            FunctionCode::WriteSingleRegister => Ok(Self::WriteSingleRegister(
                WriteSingleRegisterRequest::decode_body(r)?,
            )),
            FunctionCode::ReadExceptionStatus => Ok(Self::ReadExceptionStatus),
            FunctionCode::Diagnostics => {
                Ok(Self::Diagnostics(DiagnosticsRequest::decode_body(r)?))
            }
            FunctionCode::WriteMultipleCoils => {
                let start_address = r.read_u16()?;
                let quantity = r.read_u16()?;
                check_quantity_decode(quantity, MAX_WRITE_BITS)?;
                if !span_fits(start_address, quantity) {
                    return Err(DecodeError::InvalidValue);
                }
                let byte_count = usize::from(r.read_u8()?);
                if byte_count != points::packed_bit_len(usize::from(quantity)) {
                    return Err(DecodeError::InvalidLength);
                }
                let packed = r.read_bytes(byte_count)?;
                Ok(Self::WriteMultipleCoils(WriteMultipleCoilsData {
                    start_address,
                    quantity,
                    packed,
                }))
            }
            FunctionCode::WriteMultipleRegisters => {
                let start_address = r.read_u16()?;
                let quantity = r.read_u16()?;
                check_quantity_decode(quantity, MAX_WRITE_WORDS)?;
                if !span_fits(start_address, quantity) {
                    return Err(DecodeError::InvalidValue);
                }
                let byte_count = usize::from(r.read_u8()?);
                if byte_count != usize::from(quantity) * 2 {
                    return Err(DecodeError::InvalidLength);
                }
                let data = r.read_bytes(byte_count)?;
                Ok(Self::WriteMultipleRegisters(WriteMultipleRegistersData {
                    start_address,
                    data,
                }))
            }
            FunctionCode::ReportSlaveId => Ok(Self::ReportSlaveId),
            FunctionCode::MaskWriteRegister => Ok(Self::MaskWriteRegister(
                MaskWriteRegisterRequest::decode_body(r)?,
            )),
            FunctionCode::ReadWriteMultipleRegisters => {
                let read_start_address = r.read_u16()?;
                let read_quantity = r.read_u16()?;
                check_quantity_decode(read_quantity, MAX_READ_WORDS)?;
                if !span_fits(read_start_address, read_quantity) {
                    return Err(DecodeError::InvalidValue);
                }
                let write_start_address = r.read_u16()?;
                let write_quantity = r.read_u16()?;
                check_quantity_decode(write_quantity, MAX_RW_WRITE_WORDS)?;
                if !span_fits(write_start_address, write_quantity) {
                    return Err(DecodeError::InvalidValue);
                }
                let byte_count = usize::from(r.read_u8()?);
                if byte_count != usize::from(write_quantity) * 2 {
                    return Err(DecodeError::InvalidLength);
                }
                let data = r.read_bytes(byte_count)?;
                Ok(Self::ReadWriteMultipleRegisters(
                    ReadWriteMultipleRegistersData {
                        read_start_address,
                        read_quantity,
                        write_start_address,
                        data,
                    },
                ))
            }
            FunctionCode::ReadDeviceIdentification => Ok(Self::ReadDeviceIdentification(
                ReadDeviceIdentificationRequest::decode_body(r)?,
            )),
        }
    }
}
