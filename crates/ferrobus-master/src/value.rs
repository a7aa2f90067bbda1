//! Write-value dispatch: one user-facing value union, validated per
//! target and quantity into either a single or a multiple write.

use crate::MasterError;
use ferrobus_core::pdu::points;
use ferrobus_core::pdu::request::{COIL_OFF, COIL_ON};

/// The value argument of [`crate::Master::write`].
///
/// `Single` carries a raw wire word; for a coil only `0xFF00`/`0x0000`
/// are meaningful, but the word is passed through untouched and left for
/// the slave to judge. `Raw` is used verbatim and must match the packed
/// size of the written quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteValue {
    Single(u16),
    SingleBool(bool),
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Raw(Vec<u8>),
}

/// A validated coil write, ready to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CoilWrite {
    Single(u16),
    Multiple(Vec<bool>),
}

/// A validated register write, ready to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegisterWrite {
    Single(u16),
    Multiple(Vec<u16>),
}

pub(crate) fn plan_coil_write(
    quantity: u16,
    value: WriteValue,
) -> Result<CoilWrite, MasterError> {
    match value {
        WriteValue::SingleBool(on) => {
            if quantity != 1 {
                return Err(MasterError::InvalidQuantity(quantity));
            }
            Ok(CoilWrite::Single(if on { COIL_ON } else { COIL_OFF }))
        }
        WriteValue::Single(word) => {
            if quantity != 1 {
                return Err(MasterError::InvalidQuantity(quantity));
            }
            Ok(CoilWrite::Single(word))
        }
        WriteValue::Bits(bits) => {
            if bits.len() != usize::from(quantity) {
                return Err(MasterError::InvalidArgLength {
                    expected: usize::from(quantity),
                    got: bits.len(),
                });
            }
            Ok(CoilWrite::Multiple(bits))
        }
        WriteValue::Raw(bytes) => {
            let expected = points::packed_bit_len(usize::from(quantity));
            if bytes.len() != expected {
                return Err(MasterError::InvalidArgLength {
                    expected,
                    got: bytes.len(),
                });
            }
            let bits = points::unpack_bits(&bytes, usize::from(quantity))
                .ok_or(MasterError::InvalidValues)?;
            Ok(CoilWrite::Multiple(bits))
        }
        WriteValue::Words(_) => Err(MasterError::InvalidValues),
    }
}

pub(crate) fn plan_register_write(
    quantity: u16,
    value: WriteValue,
) -> Result<RegisterWrite, MasterError> {
    match value {
        WriteValue::Single(word) => {
            if quantity != 1 {
                return Err(MasterError::InvalidQuantity(quantity));
            }
            Ok(RegisterWrite::Single(word))
        }
        WriteValue::Words(words) => {
            if words.len() != usize::from(quantity) {
                return Err(MasterError::InvalidArgLength {
                    expected: usize::from(quantity),
                    got: words.len(),
                });
            }
            Ok(RegisterWrite::Multiple(words))
        }
        WriteValue::Raw(bytes) => {
            let expected = usize::from(quantity) * 2;
            if bytes.len() != expected {
                return Err(MasterError::InvalidArgLength {
                    expected,
                    got: bytes.len(),
                });
            }
            let words = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(RegisterWrite::Multiple(words))
        }
        WriteValue::SingleBool(_) | WriteValue::Bits(_) => Err(MasterError::InvalidValues),
    }
}
