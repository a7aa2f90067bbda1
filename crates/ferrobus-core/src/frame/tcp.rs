//! MBAP framing for Modbus TCP.

use crate::encoding::{Reader, Writer};
use crate::{DecodeError, EncodeError};

/// Fixed MBAP header size: transaction id, protocol id, length, unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU an MBAP frame may carry.
pub const MAX_PDU_LEN: usize = 253;

/// The protocol identifier is always zero for Modbus.
pub const PROTOCOL_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of everything after the length field: unit id + PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u16(self.transaction_id)?;
        w.write_u16(self.protocol_id)?;
        w.write_u16(self.length)?;
        w.write_u8(self.unit_id)?;
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let transaction_id = r.read_u16()?;
        let protocol_id = r.read_u16()?;
        let length = r.read_u16()?;
        let unit_id = r.read_u8()?;

        if protocol_id != PROTOCOL_ID {
            return Err(DecodeError::InvalidValue);
        }
        // Unit id plus at least a function code byte.
        if length < 2 {
            return Err(DecodeError::InvalidLength);
        }

        Ok(Self {
            transaction_id,
            protocol_id,
            length,
            unit_id,
        })
    }

    /// PDU byte count announced by this header.
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length) - 1
    }
}

/// Frame a PDU: 7-byte MBAP header followed by the PDU bytes.
pub fn encode_frame(
    w: &mut Writer<'_>,
    transaction_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> Result<(), EncodeError> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(EncodeError::InvalidLength);
    }

    let header = MbapHeader {
        transaction_id,
        protocol_id: PROTOCOL_ID,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };
    header.encode(w)?;
    w.write_bytes(pdu)?;
    Ok(())
}

/// Strip the MBAP header off a complete frame.
pub fn decode_frame<'a>(r: &mut Reader<'a>) -> Result<(MbapHeader, &'a [u8]), DecodeError> {
    let header = MbapHeader::decode(r)?;
    let pdu = r.read_bytes(header.pdu_len())?;
    Ok((header, pdu))
}

#[cfg(test)]
mod tests {
    use super::{decode_frame, encode_frame, MbapHeader, MBAP_HEADER_LEN};
    use crate::encoding::{Reader, Writer};
    use crate::DecodeError;

    #[test]
    fn frame_layout_is_fixed_position() {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        encode_frame(&mut w, 42, 0, &[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(
            w.written(),
            &[0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        encode_frame(&mut w, 0x0102, 0x11, &[0x01, 0x00, 0x01, 0x00, 0x01]).unwrap();

        let mut r = Reader::new(w.written());
        let (header, pdu) = decode_frame(&mut r).unwrap();
        assert_eq!(
            header,
            MbapHeader {
                transaction_id: 0x0102,
                protocol_id: 0,
                length: 6,
                unit_id: 0x11,
            }
        );
        assert_eq!(pdu, &[0x01, 0x00, 0x01, 0x00, 0x01]);
        assert!(r.is_empty());
    }

    #[test]
    fn nonzero_protocol_id_rejected() {
        let bytes = [0x00, 0x01, 0x00, 0x01, 0x00, 0x03, 0x01, 0x07, 0x00];
        let mut r = Reader::new(&bytes);
        assert_eq!(decode_frame(&mut r).unwrap_err(), DecodeError::InvalidValue);
    }

    #[test]
    fn length_below_two_rejected() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            decode_frame(&mut r).unwrap_err(),
            DecodeError::InvalidLength
        );
        assert_eq!(bytes.len(), MBAP_HEADER_LEN);
    }

    #[test]
    fn truncated_pdu_reports_eof() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            decode_frame(&mut r).unwrap_err(),
            DecodeError::UnexpectedEof
        );
    }
}
