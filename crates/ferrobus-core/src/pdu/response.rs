use crate::encoding::{Reader, Writer};
use crate::pdu::function_code::MEI_READ_DEVICE_ID;
use crate::pdu::points::{self, TargetType};
use crate::pdu::request::{COIL_OFF, COIL_ON, MAX_READ_WORDS, MAX_WRITE_BITS, MAX_WRITE_WORDS};
use crate::pdu::{ExceptionResponse, FunctionCode};
use crate::{DecodeError, EncodeError};

const MAX_WORD_DATA_LEN: usize = MAX_READ_WORDS as usize * 2;

/// FC 1 / FC 2 response: a byte-count-prefixed run of packed bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBitsResponse<'a> {
    pub target: TargetType,
    pub data: &'a [u8],
}

impl<'a> ReadBitsResponse<'a> {
    fn decode_body(target: TargetType, r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let byte_count = usize::from(r.read_u8()?);
        if byte_count == 0 || byte_count > points::packed_bit_len(2000) {
            return Err(DecodeError::InvalidLength);
        }
        Ok(Self {
            target,
            data: r.read_bytes(byte_count)?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let byte_count: u8 = self
            .data
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        if byte_count == 0 {
            return Err(EncodeError::InvalidLength);
        }
        w.write_u8(self.target.read_function().as_u8())?;
        w.write_u8(byte_count)?;
        w.write_bytes(self.data)?;
        Ok(())
    }

    pub fn bit(&self, index: usize) -> Option<bool> {
        points::bit_at(self.data, index)
    }
}

/// FC 3 / FC 4 response: a byte-count-prefixed run of big-endian words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWordsResponse<'a> {
    pub target: TargetType,
    pub data: &'a [u8],
}

impl<'a> ReadWordsResponse<'a> {
    fn decode_body(target: TargetType, r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let byte_count = usize::from(r.read_u8()?);
        if byte_count == 0 || (byte_count % 2) != 0 || byte_count > MAX_WORD_DATA_LEN {
            return Err(DecodeError::InvalidLength);
        }
        Ok(Self {
            target,
            data: r.read_bytes(byte_count)?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.data.is_empty() || (self.data.len() % 2) != 0 {
            return Err(EncodeError::InvalidLength);
        }
        let byte_count: u8 = self
            .data
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        w.write_u8(self.target.read_function().as_u8())?;
        w.write_u8(byte_count)?;
        w.write_bytes(self.data)?;
        Ok(())
    }

    pub fn word_count(&self) -> usize {
        self.data.len() / 2
    }

    pub fn word(&self, index: usize) -> Option<u16> {
        let offset = index.checked_mul(2)?;
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// FC 5 echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteSingleCoilResponse {
    pub address: u16,
    pub value: u16,
}

impl WriteSingleCoilResponse {
    pub const fn is_on(&self) -> bool {
        self.value == COIL_ON
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let address = r.read_u16()?;
        let value = r.read_u16()?;
        if value != COIL_ON && value != COIL_OFF {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self { address, value })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::WriteSingleCoil.as_u8())?;
        w.write_u16(self.address)?;
        w.write_u16(self.value)?;
        Ok(())
    }
}

/// FC 6 echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteSingleRegisterResponse {
    pub address: u16,
    pub value: u16,
}

impl WriteSingleRegisterResponse {
    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            address: r.read_u16()?,
            value: r.read_u16()?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::WriteSingleRegister.as_u8())?;
        w.write_u16(self.address)?;
        w.write_u16(self.value)?;
        Ok(())
    }
}

/// FC 15 echo: start address and quantity written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteMultipleCoilsResponse {
    pub start_address: u16,
    pub quantity: u16,
}

impl WriteMultipleCoilsResponse {
    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let start_address = r.read_u16()?;
        let quantity = r.read_u16()?;
        if quantity == 0 || quantity > MAX_WRITE_BITS {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            start_address,
            quantity,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.quantity == 0 || self.quantity > MAX_WRITE_BITS {
            return Err(EncodeError::ValueOutOfRange);
        }
        w.write_u8(FunctionCode::WriteMultipleCoils.as_u8())?;
        w.write_u16(self.start_address)?;
        w.write_u16(self.quantity)?;
        Ok(())
    }
}

/// FC 16 echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteMultipleRegistersResponse {
    pub start_address: u16,
    pub quantity: u16,
}

impl WriteMultipleRegistersResponse {
    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let start_address = r.read_u16()?;
        let quantity = r.read_u16()?;
        if quantity == 0 || quantity > MAX_WRITE_WORDS {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            start_address,
            quantity,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.quantity == 0 || self.quantity > MAX_WRITE_WORDS {
            return Err(EncodeError::ValueOutOfRange);
        }
        w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
        w.write_u16(self.start_address)?;
        w.write_u16(self.quantity)?;
        Ok(())
    }
}

/// FC 7 response: one bit per exception coil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ExceptionStatusResponse {
    pub status: u8,
}

impl ExceptionStatusResponse {
    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: r.read_u8()?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::ReadExceptionStatus.as_u8())?;
        w.write_u8(self.status)?;
        Ok(())
    }
}

/// FC 8 response: the sub-function and its data echoed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsResponse<'a> {
    pub sub_function: u16,
    pub data: &'a [u8],
}

impl<'a> DiagnosticsResponse<'a> {
    fn decode_body(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(Self {
            sub_function: r.read_u16()?,
            data: r.read_rest(),
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::Diagnostics.as_u8())?;
        w.write_u16(self.sub_function)?;
        w.write_bytes(self.data)?;
        Ok(())
    }
}

/// FC 17 response. The byte-count-prefixed block ends with the run
/// indicator status byte; everything before it identifies the slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSlaveIdResponse<'a> {
    pub device_info: &'a [u8],
}

impl<'a> ReportSlaveIdResponse<'a> {
    fn decode_body(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let byte_count = usize::from(r.read_u8()?);
        if byte_count < 2 {
            return Err(DecodeError::InvalidLength);
        }
        Ok(Self {
            device_info: r.read_bytes(byte_count)?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.device_info.len() < 2 {
            return Err(EncodeError::InvalidLength);
        }
        let byte_count: u8 = self
            .device_info
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        w.write_u8(FunctionCode::ReportSlaveId.as_u8())?;
        w.write_u8(byte_count)?;
        w.write_bytes(self.device_info)?;
        Ok(())
    }

    /// Device-specific identifier bytes (all but the status byte).
    pub fn slave_id(&self) -> &'a [u8] {
        &self.device_info[..self.device_info.len() - 1]
    }

    /// High bit of the status byte.
    pub fn run_indicator(&self) -> bool {
        (self.device_info[self.device_info.len() - 1] & 0x80) != 0
    }
}

/// FC 23 response: read-side registers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWriteMultipleRegistersResponse<'a> {
    pub data: &'a [u8],
}

impl<'a> ReadWriteMultipleRegistersResponse<'a> {
    fn decode_body(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let byte_count = usize::from(r.read_u8()?);
        if byte_count == 0 || (byte_count % 2) != 0 || byte_count > MAX_WORD_DATA_LEN {
            return Err(DecodeError::InvalidLength);
        }
        Ok(Self {
            data: r.read_bytes(byte_count)?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.data.is_empty() || (self.data.len() % 2) != 0 {
            return Err(EncodeError::InvalidLength);
        }
        let byte_count: u8 = self
            .data
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        w.write_u8(FunctionCode::ReadWriteMultipleRegisters.as_u8())?;
        w.write_u8(byte_count)?;
        w.write_bytes(self.data)?;
        Ok(())
    }

    pub fn word_count(&self) -> usize {
        self.data.len() / 2
    }

    pub fn word(&self, index: usize) -> Option<u16> {
        let offset = index.checked_mul(2)?;
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// FC 43 / MEI 0x0E response: identification sub-header plus an object
/// list. `objects_data` holds the raw `(id, len, value)` records and is
/// validated once at decode time, so [`Self::objects`] cannot fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentificationResponse<'a> {
    pub read_device_id_code: u8,
    pub conformity_level: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub object_count: u8,
    pub objects_data: &'a [u8],
}

impl<'a> DeviceIdentificationResponse<'a> {
    fn decode_body(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        if r.read_u8()? != MEI_READ_DEVICE_ID {
            return Err(DecodeError::InvalidValue);
        }
        let read_device_id_code = r.read_u8()?;
        let conformity_level = r.read_u8()?;
        let more_follows = r.read_u8()? != 0;
        let next_object_id = r.read_u8()?;
        let object_count = r.read_u8()?;
        let objects_data = r.read_rest();

        let mut seen = 0u8;
        let mut cursor = 0usize;
        while cursor < objects_data.len() {
            if objects_data.len() - cursor < 2 {
                return Err(DecodeError::InvalidLength);
            }
            let value_len = usize::from(objects_data[cursor + 1]);
            cursor += 2 + value_len;
            seen = seen.checked_add(1).ok_or(DecodeError::InvalidLength)?;
        }
        if cursor != objects_data.len() || seen != object_count {
            return Err(DecodeError::InvalidLength);
        }

        Ok(Self {
            read_device_id_code,
            conformity_level,
            more_follows,
            next_object_id,
            object_count,
            objects_data,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::ReadDeviceIdentification.as_u8())?;
        w.write_u8(MEI_READ_DEVICE_ID)?;
        w.write_u8(self.read_device_id_code)?;
        w.write_u8(self.conformity_level)?;
        w.write_u8(if self.more_follows { 0xFF } else { 0x00 })?;
        w.write_u8(self.next_object_id)?;
        w.write_u8(self.object_count)?;
        w.write_bytes(self.objects_data)?;
        Ok(())
    }

    /// Iterate the `(object id, value)` pairs.
    pub fn objects(&self) -> DeviceIdObjects<'a> {
        DeviceIdObjects {
            data: self.objects_data,
        }
    }
}

/// Iterator over validated identification objects.
#[derive(Debug, Clone, Copy)]
pub struct DeviceIdObjects<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for DeviceIdObjects<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let id = self.data[0];
        let len = usize::from(self.data[1]);
        let value = self.data.get(2..2 + len)?;
        self.data = &self.data[2 + len..];
        Some((id, value))
    }
}

/// Every response this engine can decode, keyed by the leading function
/// byte. A set high bit decodes to [`Response::Exception`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    ReadBits(ReadBitsResponse<'a>),
    ReadWords(ReadWordsResponse<'a>),
    WriteSingleCoil(WriteSingleCoilResponse),
    WriteSingleRegister(WriteSingleRegisterResponse),
    WriteMultipleCoils(WriteMultipleCoilsResponse),
    WriteMultipleRegisters(WriteMultipleRegistersResponse),
    ReadExceptionStatus(ExceptionStatusResponse),
    Diagnostics(DiagnosticsResponse<'a>),
    ReportSlaveId(ReportSlaveIdResponse<'a>),
    MaskWriteRegister(MaskWriteRegisterResponse),
    ReadWriteMultipleRegisters(ReadWriteMultipleRegistersResponse<'a>),
    ReadDeviceIdentification(DeviceIdentificationResponse<'a>),
    Exception(ExceptionResponse),
}

/// FC 22 echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MaskWriteRegisterResponse {
    pub address: u16,
    pub and_mask: u16,
    pub or_mask: u16,
}

impl MaskWriteRegisterResponse {
    fn decode_body(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            address: r.read_u16()?,
            and_mask: r.read_u16()?,
            or_mask: r.read_u16()?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::MaskWriteRegister.as_u8())?;
        w.write_u16(self.address)?;
        w.write_u16(self.and_mask)?;
        w.write_u16(self.or_mask)?;
        Ok(())
    }
}

impl<'a> Response<'a> {
    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function_byte = r.read_u8()?;
        if FunctionCode::is_exception(function_byte) {
            return Ok(Self::Exception(ExceptionResponse::decode(
                function_byte,
                r,
            )?));
        }

        match FunctionCode::from_u8(function_byte)? {
            FunctionCode::ReadCoils => Ok(Self::ReadBits(ReadBitsResponse::decode_body(
                TargetType::Coil,
                r,
            )?)),
            FunctionCode::ReadDiscreteInputs => Ok(Self::ReadBits(
                ReadBitsResponse::decode_body(TargetType::DiscreteInput, r)?,
            )),
            FunctionCode::ReadHoldingRegisters => Ok(Self::ReadWords(
                ReadWordsResponse::decode_body(TargetType::HoldingRegister, r)?,
            )),
            FunctionCode::ReadInputRegisters => Ok(Self::ReadWords(
                ReadWordsResponse::decode_body(TargetType::InputRegister, r)?,
            )),
            FunctionCode::WriteSingleCoil => Ok(Self::WriteSingleCoil(
                WriteSingleCoilResponse::decode_body(r)?,
            )),
            FunctionCode::WriteSingleRegister => Ok(Self::WriteSingleRegister(
                WriteSingleRegisterResponse::decode_body(r)?,
            )),
            FunctionCode::WriteMultipleCoils => Ok(Self::WriteMultipleCoils(
                WriteMultipleCoilsResponse::decode_body(r)?,
            )),
            FunctionCode::WriteMultipleRegisters => Ok(Self::WriteMultipleRegisters(
                WriteMultipleRegistersResponse::decode_body(r)?,
            )),
            FunctionCode::ReadExceptionStatus => Ok(Self::ReadExceptionStatus(
                ExceptionStatusResponse::decode_body(r)?,
            )),
            FunctionCode::Diagnostics => {
                Ok(Self::Diagnostics(DiagnosticsResponse::decode_body(r)?))
            }
            FunctionCode::ReportSlaveId => {
                Ok(Self::ReportSlaveId(ReportSlaveIdResponse::decode_body(r)?))
            }
            FunctionCode::MaskWriteRegister => Ok(Self::MaskWriteRegister(
                MaskWriteRegisterResponse::decode_body(r)?,
            )),
            FunctionCode::ReadWriteMultipleRegisters => Ok(Self::ReadWriteMultipleRegisters(
                ReadWriteMultipleRegistersResponse::decode_body(r)?,
            )),
            FunctionCode::ReadDeviceIdentification => Ok(Self::ReadDeviceIdentification(
                DeviceIdentificationResponse::decode_body(r)?,
            )),
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::ReadBits(resp) => resp.encode(w),
            Self::ReadWords(resp) => resp.encode(w),
            Self::WriteSingleCoil(resp) => resp.encode(w),
            Self::WriteSingleRegister(resp) => resp.encode(w),
            Self::WriteMultipleCoils(resp) => resp.encode(w),
            Self::WriteMultipleRegisters(resp) => resp.encode(w),
            Self::ReadExceptionStatus(resp) => resp.encode(w),
            Self::Diagnostics(resp) => resp.encode(w),
            Self::ReportSlaveId(resp) => resp.encode(w),
            Self::MaskWriteRegister(resp) => resp.encode(w),
            Self::ReadWriteMultipleRegisters(resp) => resp.encode(w),
            Self::ReadDeviceIdentification(resp) => resp.encode(w),
            Self::Exception(resp) => resp.encode(w),
        }
    }

    pub fn function_code(&self) -> Option<FunctionCode> {
        match self {
            Self::ReadBits(resp) => Some(resp.target.read_function()),
            Self::ReadWords(resp) => Some(resp.target.read_function()),
            Self::WriteSingleCoil(_) => Some(FunctionCode::WriteSingleCoil),
            Self::WriteSingleRegister(_) => Some(FunctionCode::WriteSingleRegister),
            Self::WriteMultipleCoils(_) => Some(FunctionCode::WriteMultipleCoils),
            Self::WriteMultipleRegisters(_) => Some(FunctionCode::WriteMultipleRegisters),
            Self::ReadExceptionStatus(_) => Some(FunctionCode::ReadExceptionStatus),
            Self::Diagnostics(_) => Some(FunctionCode::Diagnostics),
            Self::ReportSlaveId(_) => Some(FunctionCode::ReportSlaveId),
            Self::MaskWriteRegister(_) => Some(FunctionCode::MaskWriteRegister),
            Self::ReadWriteMultipleRegisters(_) => {
                Some(FunctionCode::ReadWriteMultipleRegisters)
            }
            Self::ReadDeviceIdentification(_) => Some(FunctionCode::ReadDeviceIdentification),
            Self::Exception(_) => None,
        }
    }
}
