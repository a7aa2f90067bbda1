//! Request dispatch: typed request in, normal-or-exception response
//! PDU out. Framing and line control stay in the engine.

use crate::handlers::HandlerRegistry;
use ferrobus_core::encoding::{Reader, Writer};
use ferrobus_core::pdu::request::DIAG_RETURN_QUERY_DATA;
use ferrobus_core::pdu::{
    points, DecodedRequest, DiagnosticsResponse, ExceptionCode, ExceptionStatusResponse,
    FunctionCode, PointValues, ReadRequest, ReportSlaveIdResponse, TargetType,
};
use ferrobus_core::{DecodeError, EncodeError};
use ferrobus_core::frame::rtu;
use ferrobus_core::pdu::function_code::MEI_READ_DEVICE_ID;

/// Parse and serve one request PDU. Always yields a response PDU; the
/// engine decides whether it actually goes on the wire (broadcasts are
/// answered by silence).
pub(crate) fn dispatch(registry: &mut HandlerRegistry, request_pdu: &[u8]) -> Vec<u8> {
    let function = request_pdu.first().copied().unwrap_or(0) & 0x7F;
    match serve(registry, request_pdu) {
        Ok(response_pdu) => response_pdu,
        Err(code) => vec![function | 0x80, code.as_u8()],
    }
}

fn map_decode_error(err: DecodeError) -> ExceptionCode {
    match err {
        DecodeError::InvalidFunctionCode => ExceptionCode::IllegalFunction,
        DecodeError::UnexpectedEof
        | DecodeError::InvalidLength
        | DecodeError::InvalidValue
        | DecodeError::TrailingBytes => ExceptionCode::IllegalDataValue,
        DecodeError::InvalidCrc => ExceptionCode::SlaveDeviceFailure,
    }
}

fn encode_with(
    build: impl FnOnce(&mut Writer<'_>) -> Result<(), EncodeError>,
) -> Result<Vec<u8>, ExceptionCode> {
    let mut buf = [0u8; rtu::MAX_PDU_LEN];
    let mut w = Writer::new(&mut buf);
    build(&mut w).map_err(|_| ExceptionCode::SlaveDeviceFailure)?;
    Ok(w.written().to_vec())
}

fn serve(
    registry: &mut HandlerRegistry,
    request_pdu: &[u8],
) -> Result<Vec<u8>, ExceptionCode> {
    let mut reader = Reader::new(request_pdu);
    let request = DecodedRequest::decode(&mut reader).map_err(map_decode_error)?;
    if !reader.is_empty() {
        return Err(ExceptionCode::IllegalDataValue);
    }

    match request {
        DecodedRequest::Read(req) => serve_read(registry, req),
        DecodedRequest::WriteSingleCoil(req) => {
            let handler = registry
                .writer(TargetType::Coil)
                .ok_or(ExceptionCode::IllegalFunction)?;
            handler(req.address, &PointValues::Bits(vec![req.is_on()]))?;
            encode_with(|w| {
                w.write_u8(FunctionCode::WriteSingleCoil.as_u8())?;
                w.write_u16(req.address)?;
                w.write_u16(req.value)?;
                Ok(())
            })
        }
        DecodedRequest::WriteSingleRegister(req) => {
            let handler = registry
                .writer(TargetType::HoldingRegister)
                .ok_or(ExceptionCode::IllegalFunction)?;
            handler(req.address, &PointValues::Words(vec![req.value]))?;
            encode_with(|w| {
                w.write_u8(FunctionCode::WriteSingleRegister.as_u8())?;
                w.write_u16(req.address)?;
                w.write_u16(req.value)?;
                Ok(())
            })
        }
        DecodedRequest::WriteMultipleCoils(req) => {
            let mut bits = Vec::with_capacity(usize::from(req.quantity));
            for index in 0..usize::from(req.quantity) {
                bits.push(req.bit(index).ok_or(ExceptionCode::IllegalDataValue)?);
            }
            let handler = registry
                .writer(TargetType::Coil)
                .ok_or(ExceptionCode::IllegalFunction)?;
            handler(req.start_address, &PointValues::Bits(bits))?;
            encode_with(|w| {
                w.write_u8(FunctionCode::WriteMultipleCoils.as_u8())?;
                w.write_u16(req.start_address)?;
                w.write_u16(req.quantity)?;
                Ok(())
            })
        }
        DecodedRequest::WriteMultipleRegisters(req) => {
            let quantity = req.quantity();
            let mut words = Vec::with_capacity(quantity);
            for index in 0..quantity {
                words.push(req.word(index).ok_or(ExceptionCode::IllegalDataValue)?);
            }
            let handler = registry
                .writer(TargetType::HoldingRegister)
                .ok_or(ExceptionCode::IllegalFunction)?;
            handler(req.start_address, &PointValues::Words(words))?;
            encode_with(|w| {
                w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
                w.write_u16(req.start_address)?;
                w.write_u16(quantity as u16)?;
                Ok(())
            })
        }
        DecodedRequest::ReadExceptionStatus => {
            let handler = registry
                .exception_status()
                .ok_or(ExceptionCode::IllegalFunction)?;
            let status = handler()?;
            encode_with(|w| ExceptionStatusResponse { status }.encode(w))
        }
        DecodedRequest::Diagnostics(req) => {
            let data = if let Some(handler) = registry.diagnostics() {
                handler(req.sub_function, req.data)?
            } else if req.sub_function == DIAG_RETURN_QUERY_DATA {
                // Loopback works out of the box; other sub-functions need
                // a registered handler.
                req.data.to_vec()
            } else {
                return Err(ExceptionCode::IllegalFunction);
            };
            encode_with(|w| {
                DiagnosticsResponse {
                    sub_function: req.sub_function,
                    data: &data,
                }
                .encode(w)
            })
        }
        DecodedRequest::ReportSlaveId => {
            let handler = registry
                .report_slave_id()
                .ok_or(ExceptionCode::IllegalFunction)?;
            let report = handler()?;
            let mut device_info = report.slave_id;
            device_info.push(if report.run_indicator { 0xFF } else { 0x00 });
            encode_with(|w| {
                ReportSlaveIdResponse {
                    device_info: &device_info,
                }
                .encode(w)
            })
        }
        DecodedRequest::MaskWriteRegister(req) => {
            let current = {
                let reader = registry
                    .reader(TargetType::HoldingRegister)
                    .ok_or(ExceptionCode::IllegalFunction)?;
                match reader(req.address, 1)? {
                    PointValues::Words(words) if words.len() == 1 => words[0],
                    _ => return Err(ExceptionCode::SlaveDeviceFailure),
                }
            };
            let next = (current & req.and_mask) | (req.or_mask & !req.and_mask);
            let writer = registry
                .writer(TargetType::HoldingRegister)
                .ok_or(ExceptionCode::IllegalFunction)?;
            writer(req.address, &PointValues::Words(vec![next]))?;
            encode_with(|w| {
                w.write_u8(FunctionCode::MaskWriteRegister.as_u8())?;
                w.write_u16(req.address)?;
                w.write_u16(req.and_mask)?;
                w.write_u16(req.or_mask)?;
                Ok(())
            })
        }
        DecodedRequest::ReadWriteMultipleRegisters(req) => {
            // The write side executes before the read side.
            let write_quantity = req.write_quantity();
            let mut words = Vec::with_capacity(write_quantity);
            for index in 0..write_quantity {
                words.push(req.word(index).ok_or(ExceptionCode::IllegalDataValue)?);
            }
            {
                let writer = registry
                    .writer(TargetType::HoldingRegister)
                    .ok_or(ExceptionCode::IllegalFunction)?;
                writer(req.write_start_address, &PointValues::Words(words))?;
            }

            let reader = registry
                .reader(TargetType::HoldingRegister)
                .ok_or(ExceptionCode::IllegalFunction)?;
            let values = reader(req.read_start_address, req.read_quantity)?;
            let read_words = match values {
                PointValues::Words(words)
                    if words.len() == usize::from(req.read_quantity) =>
                {
                    words
                }
                _ => return Err(ExceptionCode::SlaveDeviceFailure),
            };
            encode_with(|w| {
                w.write_u8(FunctionCode::ReadWriteMultipleRegisters.as_u8())?;
                w.write_u8((read_words.len() * 2) as u8)?;
                for word in &read_words {
                    w.write_u16(*word)?;
                }
                Ok(())
            })
        }
        DecodedRequest::ReadDeviceIdentification(req) => {
            let handler = registry
                .device_identification()
                .ok_or(ExceptionCode::IllegalFunction)?;
            let identity = handler(req.read_device_id_code, req.object_id)?;

            let objects: Vec<_> = match req.read_device_id_code {
                0x01 => identity
                    .objects
                    .iter()
                    .filter(|object| object.object_id <= 0x02)
                    .collect(),
                0x02 => identity
                    .objects
                    .iter()
                    .filter(|object| object.object_id <= 0x06)
                    .collect(),
                0x03 => identity.objects.iter().collect(),
                0x04 => {
                    let object = identity
                        .objects
                        .iter()
                        .find(|object| object.object_id == req.object_id)
                        .ok_or(ExceptionCode::IllegalDataAddress)?;
                    vec![object]
                }
                _ => return Err(ExceptionCode::IllegalDataValue),
            };
            let object_count =
                u8::try_from(objects.len()).map_err(|_| ExceptionCode::SlaveDeviceFailure)?;

            encode_with(|w| {
                w.write_u8(FunctionCode::ReadDeviceIdentification.as_u8())?;
                w.write_u8(MEI_READ_DEVICE_ID)?;
                w.write_u8(req.read_device_id_code)?;
                w.write_u8(identity.conformity_level)?;
                w.write_u8(0x00)?; // no continuation support
                w.write_u8(0x00)?;
                w.write_u8(object_count)?;
                for object in &objects {
                    let value_len = u8::try_from(object.value.len())
                        .map_err(|_| EncodeError::ValueOutOfRange)?;
                    w.write_u8(object.object_id)?;
                    w.write_u8(value_len)?;
                    w.write_bytes(&object.value)?;
                }
                Ok(())
            })
        }
    }
}

fn serve_read(
    registry: &mut HandlerRegistry,
    req: ReadRequest,
) -> Result<Vec<u8>, ExceptionCode> {
    let handler = registry
        .reader(req.target)
        .ok_or(ExceptionCode::IllegalFunction)?;
    let values = handler(req.start_address, req.quantity)?;
    if !values.fits_target(req.target) || values.len() != usize::from(req.quantity) {
        return Err(ExceptionCode::SlaveDeviceFailure);
    }

    match values {
        PointValues::Bits(bits) => {
            let byte_count = points::packed_bit_len(bits.len());
            let mut packed = [0u8; points::packed_bit_len(2000)];
            points::pack_bits(&bits, &mut packed[..byte_count]);
            encode_with(|w| {
                w.write_u8(req.target.read_function().as_u8())?;
                w.write_u8(byte_count as u8)?;
                w.write_bytes(&packed[..byte_count])?;
                Ok(())
            })
        }
        PointValues::Words(words) => encode_with(|w| {
            w.write_u8(req.target.read_function().as_u8())?;
            w.write_u8((words.len() * 2) as u8)?;
            for word in &words {
                w.write_u16(*word)?;
            }
            Ok(())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::dispatch;
    use crate::handlers::{DeviceIdObject, DeviceIdentity, HandlerRegistry, SlaveIdReport};
    use ferrobus_core::pdu::{ExceptionCode, PointValues, TargetType};
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;

    fn registry_with_coil_reader() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.on_read(
            TargetType::Coil,
            Box::new(|start, quantity| {
                // Coil N is on when N is even.
                Ok(PointValues::Bits(
                    (start..start + quantity).map(|addr| addr % 2 == 0).collect(),
                ))
            }),
        );
        registry
    }

    #[test]
    fn read_coils_packs_response() {
        let mut registry = registry_with_coil_reader();
        let response = dispatch(&mut registry, &[0x01, 0x00, 0x00, 0x00, 0x04]);
        assert_eq!(response, vec![0x01, 0x01, 0b0000_0101]);
    }

    #[test]
    fn missing_handler_answers_illegal_function() {
        let mut registry = HandlerRegistry::new();
        let response = dispatch(&mut registry, &[0x04, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(response, vec![0x84, 0x01]);
    }

    #[test]
    fn invalid_quantity_answers_illegal_data_value() {
        let mut registry = registry_with_coil_reader();
        // Quantity zero.
        let response = dispatch(&mut registry, &[0x01, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(response, vec![0x81, 0x03]);
        // Quantity above the FC01 ceiling of 2000.
        let response = dispatch(&mut registry, &[0x01, 0x00, 0x00, 0x07, 0xD1]);
        assert_eq!(response, vec![0x81, 0x03]);
    }

    #[test]
    fn handler_exception_reaches_the_wire() {
        let mut registry = HandlerRegistry::new();
        registry.on_read(
            TargetType::HoldingRegister,
            Box::new(|_, _| Err(ExceptionCode::IllegalDataAddress)),
        );
        let response = dispatch(&mut registry, &[0x03, 0x12, 0x34, 0x00, 0x01]);
        assert_eq!(response, vec![0x83, 0x02]);
    }

    #[test]
    fn unrecognized_function_answers_illegal_function() {
        let mut registry = HandlerRegistry::new();
        let response = dispatch(&mut registry, &[0x42, 0x00]);
        assert_eq!(response, vec![0xC2, 0x01]);
    }

    #[test]
    fn write_single_coil_delivers_bool_and_echoes() {
        let seen = Arc::new(AtomicU16::new(0xFFFF));
        let seen_in_handler = Arc::clone(&seen);

        let mut registry = HandlerRegistry::new();
        registry.on_write(
            TargetType::Coil,
            Box::new(move |address, values| {
                assert_eq!(values, &PointValues::Bits(vec![true]));
                seen_in_handler.store(address, Ordering::Relaxed);
                Ok(())
            }),
        );

        let response = dispatch(&mut registry, &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
        assert_eq!(response, vec![0x05, 0x00, 0xAC, 0xFF, 0x00]);
        assert_eq!(seen.load(Ordering::Relaxed), 0x00AC);
    }

    #[test]
    fn write_multiple_registers_unpacks_words() {
        let mut registry = HandlerRegistry::new();
        registry.on_write(
            TargetType::HoldingRegister,
            Box::new(|start, values| {
                assert_eq!(start, 0x0001);
                assert_eq!(values, &PointValues::Words(vec![0x000A, 0x0102]));
                Ok(())
            }),
        );

        let response = dispatch(
            &mut registry,
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
        );
        assert_eq!(response, vec![0x10, 0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn mask_write_reads_modifies_writes() {
        // Current value 0x0012, AND 0x00F2, OR 0x0025 -> 0x0017.
        let mut registry = HandlerRegistry::new();
        registry.on_read(
            TargetType::HoldingRegister,
            Box::new(|_, _| Ok(PointValues::Words(vec![0x0012]))),
        );
        registry.on_write(
            TargetType::HoldingRegister,
            Box::new(|address, values| {
                assert_eq!(address, 0x0004);
                assert_eq!(values, &PointValues::Words(vec![0x0017]));
                Ok(())
            }),
        );

        let response = dispatch(
            &mut registry,
            &[0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25],
        );
        assert_eq!(response, vec![0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25]);
    }

    #[test]
    fn diagnostics_loopback_echoes_without_handler() {
        let mut registry = HandlerRegistry::new();
        let response = dispatch(&mut registry, &[0x08, 0x00, 0x00, 0xA5, 0x37]);
        assert_eq!(response, vec![0x08, 0x00, 0x00, 0xA5, 0x37]);

        // Other sub-functions require a handler.
        let response = dispatch(&mut registry, &[0x08, 0x00, 0x0A, 0x00, 0x00]);
        assert_eq!(response, vec![0x88, 0x01]);
    }

    #[test]
    fn report_slave_id_appends_run_indicator() {
        let mut registry = HandlerRegistry::new();
        registry.on_report_slave_id(Box::new(|| {
            Ok(SlaveIdReport {
                slave_id: vec![0x42, 0x43],
                run_indicator: true,
            })
        }));

        let response = dispatch(&mut registry, &[0x11]);
        assert_eq!(response, vec![0x11, 0x03, 0x42, 0x43, 0xFF]);
    }

    #[test]
    fn device_identification_filters_by_read_code() {
        let identity = || DeviceIdentity {
            conformity_level: 0x01,
            objects: vec![
                DeviceIdObject {
                    object_id: 0x00,
                    value: b"Acme".to_vec(),
                },
                DeviceIdObject {
                    object_id: 0x01,
                    value: b"FB".to_vec(),
                },
                DeviceIdObject {
                    object_id: 0x03,
                    value: b"extra".to_vec(),
                },
            ],
        };
        let mut registry = HandlerRegistry::new();
        registry.on_read_device_identification(Box::new(move |_, _| Ok(identity())));

        // Basic stream: only objects 0x00..=0x02.
        let response = dispatch(&mut registry, &[0x2B, 0x0E, 0x01, 0x00]);
        assert_eq!(
            response,
            vec![
                0x2B, 0x0E, 0x01, 0x01, 0x00, 0x00, 0x02, 0x00, 0x04, b'A', b'c', b'm', b'e',
                0x01, 0x02, b'F', b'B',
            ]
        );

        // Specific object that does not exist.
        let response = dispatch(&mut registry, &[0x2B, 0x0E, 0x04, 0x7F]);
        assert_eq!(response, vec![0xAB, 0x02]);
    }

    #[test]
    fn read_write_multiple_writes_then_reads() {
        let written = Arc::new(AtomicU16::new(0));
        let written_in_handler = Arc::clone(&written);

        let mut registry = HandlerRegistry::new();
        registry.on_write(
            TargetType::HoldingRegister,
            Box::new(move |start, values| {
                assert_eq!(start, 0x000E);
                assert_eq!(values, &PointValues::Words(vec![0x00FF]));
                written_in_handler.store(0x00FF, Ordering::Relaxed);
                Ok(())
            }),
        );
        let written_in_reader = Arc::clone(&written);
        registry.on_read(
            TargetType::HoldingRegister,
            Box::new(move |_, quantity| {
                // The write must have landed before the read runs.
                assert_eq!(written_in_reader.load(Ordering::Relaxed), 0x00FF);
                Ok(PointValues::Words(vec![0x1234; usize::from(quantity)]))
            }),
        );

        let response = dispatch(
            &mut registry,
            &[0x17, 0x00, 0x03, 0x00, 0x02, 0x00, 0x0E, 0x00, 0x01, 0x02, 0x00, 0xFF],
        );
        assert_eq!(response, vec![0x17, 0x04, 0x12, 0x34, 0x12, 0x34]);
    }

    #[test]
    fn handler_size_mismatch_is_a_device_failure() {
        let mut registry = HandlerRegistry::new();
        registry.on_read(
            TargetType::InputRegister,
            Box::new(|_, _| Ok(PointValues::Words(vec![1, 2, 3]))),
        );
        let response = dispatch(&mut registry, &[0x04, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(response, vec![0x84, 0x04]);
    }
}
