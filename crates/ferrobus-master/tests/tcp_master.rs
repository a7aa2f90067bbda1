use ferrobus_core::encoding::Writer;
use ferrobus_core::frame::tcp;
use ferrobus_core::pdu::TargetType;
use ferrobus_master::{Master, MasterConfig, MasterError, WriteValue};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

async fn read_request_frame(socket: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut header = [0u8; tcp::MBAP_HEADER_LEN];
    socket.read_exact(&mut header).await.unwrap();
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
    let mut pdu = vec![0u8; length - 1];
    socket.read_exact(&mut pdu).await.unwrap();
    (transaction_id, pdu)
}

async fn send_response_frame(socket: &mut TcpStream, transaction_id: u16, pdu: &[u8]) {
    let mut frame = vec![0u8; tcp::MBAP_HEADER_LEN + pdu.len()];
    let mut w = Writer::new(&mut frame);
    tcp::encode_frame(&mut w, transaction_id, 0, pdu).unwrap();
    socket.write_all(w.written()).await.unwrap();
}

fn quick_config() -> MasterConfig {
    MasterConfig::default()
        .with_response_timeout(Duration::from_millis(500))
        .with_reconnect_delay(Duration::from_millis(10))
}

#[tokio::test]
async fn read_holding_registers_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, pdu) = read_request_frame(&mut socket).await;
        assert_eq!(pdu, vec![0x03, 0x00, 0x00, 0x00, 0x03]);
        send_response_frame(&mut socket, tid, &[0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E])
            .await;
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();
    let words = master.read_holding_registers(0, 3).await.unwrap();
    assert_eq!(words, vec![10, 20, 30]);

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn responses_pair_by_transaction_id_not_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let first = read_request_frame(&mut socket).await;
        let second = read_request_frame(&mut socket).await;

        // Answer in reverse arrival order; the start address picks the value.
        for (tid, pdu) in [second, first] {
            let start = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value: u16 = if start == 0 { 0x0A } else { 0x0B };
            let value = value.to_be_bytes();
            send_response_frame(&mut socket, tid, &[0x03, 0x02, value[0], value[1]]).await;
        }
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();
    let (low, high) = tokio::join!(
        master.read_holding_registers(0, 1),
        master.read_holding_registers(5, 1),
    );
    assert_eq!(low.unwrap(), vec![0x0A]);
    assert_eq!(high.unwrap(), vec![0x0B]);

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn generic_write_packs_coil_bits() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, pdu) = read_request_frame(&mut socket).await;
        assert_eq!(pdu, vec![0x0F, 0x00, 0x10, 0x00, 0x04, 0x01, 0x0D]);
        send_response_frame(&mut socket, tid, &[0x0F, 0x00, 0x10, 0x00, 0x04]).await;
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();
    master
        .write(
            TargetType::Coil,
            0x0010,
            4,
            WriteValue::Bits(vec![true, false, true, true]),
        )
        .await
        .unwrap();

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn generic_write_rejects_read_only_targets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let master = Master::connect(addr, quick_config()).await.unwrap();
    let err = master
        .write(TargetType::DiscreteInput, 0, 1, WriteValue::SingleBool(true))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MasterError::ReadOnlyTarget(TargetType::DiscreteInput)
    ));

    master.disconnect().await;
}

#[tokio::test]
async fn exception_response_becomes_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, _) = read_request_frame(&mut socket).await;
        send_response_frame(&mut socket, tid, &[0x81, 0x02]).await;
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();
    let err = master.read_coils(1, 1).await.unwrap_err();
    match err {
        MasterError::Exception(ex) => {
            assert_eq!(ex.function_code, 0x01);
            assert_eq!(ex.exception_code.as_u8(), 0x02);
        }
        other => panic!("expected exception, got {other:?}"),
    }

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn silent_peer_times_out_and_late_response_is_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, _) = read_request_frame(&mut socket).await;
        // Answer well after the master has given up.
        sleep(Duration::from_millis(150)).await;
        send_response_frame(&mut socket, tid, &[0x03, 0x02, 0x00, 0x2A]).await;
        sleep(Duration::from_millis(100)).await;
    });

    let config = quick_config().with_response_timeout(Duration::from_millis(50));
    let master = Master::connect(addr, config).await.unwrap();
    let err = master.read_holding_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, MasterError::ResponseTimeout));

    // The stale response must be swallowed, not delivered to anyone.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(master.late_response_count(), 1);

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn disconnect_stops_new_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let master = Master::connect(addr, quick_config()).await.unwrap();
    master.disconnect().await;
    assert!(!master.is_connected().await);

    let err = master.read_coils(0, 1).await.unwrap_err();
    assert!(matches!(err, MasterError::Disconnected));
}

#[tokio::test]
async fn dropped_connection_is_redialed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // First connection dies immediately; the master must redial.
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, _) = read_request_frame(&mut socket).await;
        send_response_frame(&mut socket, tid, &[0x03, 0x02, 0x00, 0x2A]).await;
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();

    let mut words = None;
    for _ in 0..100 {
        match master.read_holding_registers(0, 1).await {
            Ok(value) => {
                words = Some(value);
                break;
            }
            Err(_) => sleep(Duration::from_millis(20)).await,
        }
    }
    assert_eq!(words.expect("master should recover"), vec![0x2A]);

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn report_slave_id_over_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, pdu) = read_request_frame(&mut socket).await;
        assert_eq!(pdu, vec![0x11]);
        send_response_frame(&mut socket, tid, &[0x11, 0x03, 0x42, 0x43, 0xFF]).await;
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();
    let report = master.report_slave_id().await.unwrap();
    assert_eq!(report.slave_id, vec![0x42, 0x43]);
    assert!(report.run_indicator);

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn read_device_identification_collects_objects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, pdu) = read_request_frame(&mut socket).await;
        assert_eq!(pdu, vec![0x2B, 0x0E, 0x01, 0x00]);
        send_response_frame(
            &mut socket,
            tid,
            &[
                0x2B, 0x0E, 0x01, 0x01, 0x00, 0x00, 0x02, 0x00, 0x04, b'A', b'c', b'm', b'e',
                0x01, 0x02, b'F', b'B',
            ],
        )
        .await;
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();
    let ident = master.read_device_identification(0x01, 0x00).await.unwrap();
    assert_eq!(ident.conformity_level, 0x01);
    assert_eq!(ident.objects.len(), 2);
    assert_eq!(ident.objects[0].value, b"Acme".to_vec());
    assert_eq!(ident.objects[1].object_id, 0x01);

    master.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn diagnostics_echoes_data() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (tid, pdu) = read_request_frame(&mut socket).await;
        assert_eq!(pdu, vec![0x08, 0x00, 0x00, 0xA5, 0x37]);
        send_response_frame(&mut socket, tid, &pdu).await;
    });

    let master = Master::connect(addr, quick_config()).await.unwrap();
    let echoed = master.diagnostics(0x0000, &[0xA5, 0x37]).await.unwrap();
    assert_eq!(echoed, vec![0xA5, 0x37]);

    master.disconnect().await;
    server.await.unwrap();
}
