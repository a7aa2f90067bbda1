use core::fmt;

/// Errors raised while encoding Modbus data into an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EncodeError {
    /// The output buffer cannot hold the encoded bytes.
    BufferTooSmall,
    /// A quantity, address range or payload size is outside its protocol limit.
    ValueOutOfRange,
    /// A payload length does not match the declared quantity.
    InvalidLength,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => f.write_str("output buffer too small"),
            Self::ValueOutOfRange => f.write_str("value out of range"),
            Self::InvalidLength => f.write_str("invalid payload length"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}

/// Errors raised while decoding Modbus data from an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodeError {
    /// The input ended before a complete field could be read.
    UnexpectedEof,
    /// The function code is not part of the recognized set.
    InvalidFunctionCode,
    /// A length or byte-count field is inconsistent with the payload.
    InvalidLength,
    /// A field carries a value the protocol does not allow.
    InvalidValue,
    /// An RTU frame failed its CRC-16 check.
    InvalidCrc,
    /// Bytes remained after the end of a complete message.
    TrailingBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => f.write_str("unexpected end of input"),
            Self::InvalidFunctionCode => f.write_str("unrecognized function code"),
            Self::InvalidLength => f.write_str("invalid length field"),
            Self::InvalidValue => f.write_str("invalid field value"),
            Self::InvalidCrc => f.write_str("crc mismatch"),
            Self::TrailingBytes => f.write_str("trailing bytes after message"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}
