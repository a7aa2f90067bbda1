//! RTU framing: slave address + PDU + CRC-16, plus request length
//! prediction for gap-delimited receivers.

use crate::encoding::Writer;
use crate::{DecodeError, EncodeError};

/// Shortest ADU that can carry anything: address + function code + CRC.
pub const MIN_ADU_LEN: usize = 4;

/// Largest PDU an RTU frame may carry (256-byte ADU minus address and CRC).
pub const MAX_PDU_LEN: usize = 253;

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC16_TABLE: [u16; 256] = build_crc16_table();

/// Modbus CRC-16: polynomial 0xA001 (reflected), initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for byte in data {
        let idx = ((crc ^ u16::from(*byte)) & 0x00FF) as usize;
        crc = (crc >> 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Frame a PDU for the serial line. The CRC is transmitted little-endian.
pub fn encode_frame(w: &mut Writer<'_>, address: u8, pdu: &[u8]) -> Result<(), EncodeError> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(EncodeError::InvalidLength);
    }

    w.write_u8(address)?;
    w.write_bytes(pdu)?;

    let mut covered = [0u8; 1 + MAX_PDU_LEN];
    covered[0] = address;
    covered[1..1 + pdu.len()].copy_from_slice(pdu);
    let crc = crc16(&covered[..1 + pdu.len()]);
    w.write_bytes(&crc.to_le_bytes())?;
    Ok(())
}

/// Validate a complete frame and split it into `(address, pdu)`.
pub fn decode_frame(adu: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    if adu.len() < MIN_ADU_LEN {
        return Err(DecodeError::InvalidLength);
    }

    let covered = &adu[..adu.len() - 2];
    let received = u16::from_le_bytes([adu[adu.len() - 2], adu[adu.len() - 1]]);
    if crc16(covered) != received {
        return Err(DecodeError::InvalidCrc);
    }

    Ok((covered[0], &covered[1..]))
}

/// Expected length of a request PDU, inferred from its leading bytes.
///
/// Returns `Ok(None)` while the buffered prefix is too short to tell (the
/// variable-length writes carry their byte count at a fixed offset), and
/// `Err(InvalidFunctionCode)` when the first byte is not a recognized
/// request, since no length can be predicted for it.
pub fn request_pdu_len(pdu: &[u8]) -> Result<Option<usize>, DecodeError> {
    let Some(&function) = pdu.first() else {
        return Ok(None);
    };
    let len = match function {
        // Reads and single writes: function + address + quantity/value.
        0x01..=0x06 => Some(5),
        // Read Exception Status and Report Slave ID have no body.
        0x07 | 0x11 => Some(1),
        // Diagnostics: function + sub-function + one data word.
        0x08 => Some(5),
        // Multi-point writes: byte count sits behind the fixed header.
        0x0F | 0x10 => {
            if pdu.len() > 5 {
                Some(6 + usize::from(pdu[5]))
            } else {
                None
            }
        }
        0x16 => Some(7),
        0x17 => {
            if pdu.len() > 9 {
                Some(10 + usize::from(pdu[9]))
            } else {
                None
            }
        }
        // Read Device Identification: MEI type + read code + object id.
        0x2B => Some(4),
        _ => return Err(DecodeError::InvalidFunctionCode),
    };
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::{crc16, decode_frame, encode_frame, request_pdu_len};
    use crate::encoding::Writer;
    use crate::DecodeError;

    #[test]
    fn crc16_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
        assert_eq!(crc16(&[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02]), 0x63B6);
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        encode_frame(&mut w, 0x01, &[0x01, 0x00, 0x01, 0x00, 0x01]).unwrap();

        let (address, pdu) = decode_frame(w.written()).unwrap();
        assert_eq!(address, 0x01);
        assert_eq!(pdu, &[0x01, 0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn single_bit_corruption_is_detected() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        encode_frame(&mut w, 0x11, &[0x03, 0x00, 0x6B, 0x00, 0x03]).unwrap();
        let clean = w.written().to_vec();

        for byte_index in 0..clean.len() {
            for bit in 0..8 {
                let mut tampered = clean.clone();
                tampered[byte_index] ^= 1 << bit;
                assert_eq!(
                    decode_frame(&tampered).unwrap_err(),
                    DecodeError::InvalidCrc,
                    "flip of byte {byte_index} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn short_frames_are_noise() {
        assert_eq!(
            decode_frame(&[0x01, 0x03, 0x00]).unwrap_err(),
            DecodeError::InvalidLength
        );
    }

    #[test]
    fn fixed_length_requests_predicted() {
        assert_eq!(request_pdu_len(&[0x01]).unwrap(), Some(5));
        assert_eq!(request_pdu_len(&[0x06]).unwrap(), Some(5));
        assert_eq!(request_pdu_len(&[0x07]).unwrap(), Some(1));
        assert_eq!(request_pdu_len(&[0x08]).unwrap(), Some(5));
        assert_eq!(request_pdu_len(&[0x11]).unwrap(), Some(1));
        assert_eq!(request_pdu_len(&[0x16]).unwrap(), Some(7));
        assert_eq!(request_pdu_len(&[0x2B]).unwrap(), Some(4));
    }

    #[test]
    fn variable_length_requests_wait_for_byte_count() {
        assert_eq!(request_pdu_len(&[0x0F, 0x00, 0x13, 0x00, 0x0A]).unwrap(), None);
        assert_eq!(
            request_pdu_len(&[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02]).unwrap(),
            Some(8)
        );
        assert_eq!(
            request_pdu_len(&[0x10, 0x00, 0x01, 0x00, 0x02, 0x04]).unwrap(),
            Some(10)
        );
        assert_eq!(
            request_pdu_len(&[0x17, 0x00, 0x03, 0x00, 0x06, 0x00, 0x0E, 0x00, 0x01]).unwrap(),
            None
        );
        assert_eq!(
            request_pdu_len(&[0x17, 0x00, 0x03, 0x00, 0x06, 0x00, 0x0E, 0x00, 0x01, 0x02])
                .unwrap(),
            Some(12)
        );
    }

    #[test]
    fn unknown_function_has_no_predicted_length() {
        assert_eq!(
            request_pdu_len(&[0x42]).unwrap_err(),
            DecodeError::InvalidFunctionCode
        );
        assert_eq!(request_pdu_len(&[]).unwrap(), None);
    }
}
