use crate::DecodeError;

/// MEI type carried by Read Device Identification (FC 43) requests.
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// The function codes this engine recognizes. The set is closed: anything
/// else on the wire decodes to [`DecodeError::InvalidFunctionCode`], which a
/// slave answers with exception 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    ReadExceptionStatus,
    Diagnostics,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    ReportSlaveId,
    MaskWriteRegister,
    ReadWriteMultipleRegisters,
    ReadDeviceIdentification,
}

impl FunctionCode {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::ReadExceptionStatus => 0x07,
            Self::Diagnostics => 0x08,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
            Self::ReportSlaveId => 0x11,
            Self::MaskWriteRegister => 0x16,
            Self::ReadWriteMultipleRegisters => 0x17,
            Self::ReadDeviceIdentification => 0x2B,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x01 => Ok(Self::ReadCoils),
            0x02 => Ok(Self::ReadDiscreteInputs),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x04 => Ok(Self::ReadInputRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x07 => Ok(Self::ReadExceptionStatus),
            0x08 => Ok(Self::Diagnostics),
            0x0F => Ok(Self::WriteMultipleCoils),
            0x10 => Ok(Self::WriteMultipleRegisters),
            0x11 => Ok(Self::ReportSlaveId),
            0x16 => Ok(Self::MaskWriteRegister),
            0x17 => Ok(Self::ReadWriteMultipleRegisters),
            0x2B => Ok(Self::ReadDeviceIdentification),
            _ => Err(DecodeError::InvalidFunctionCode),
        }
    }

    /// An exception response sets the high bit of the request function code.
    pub const fn is_exception(value: u8) -> bool {
        (value & 0x80) != 0
    }
}
