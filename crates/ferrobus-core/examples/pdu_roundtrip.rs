use ferrobus_core::encoding::{Reader, Writer};
use ferrobus_core::pdu::{ReadRequest, Request, Response, TargetType};

fn main() {
    let request = Request::Read(ReadRequest {
        target: TargetType::HoldingRegister,
        start_address: 0x006B,
        quantity: 2,
    });

    let mut request_buf = [0u8; 16];
    let mut w = Writer::new(&mut request_buf);
    request.encode(&mut w).expect("request should encode");
    println!("request pdu: {:02X?}", w.written());

    let response_pdu = [0x03u8, 0x04, 0x02, 0x2B, 0x00, 0x64];
    let mut r = Reader::new(&response_pdu);
    match Response::decode(&mut r).expect("response should decode") {
        Response::ReadWords(resp) => {
            for index in 0..resp.word_count() {
                println!("register[{index}] = {}", resp.word(index).unwrap());
            }
        }
        other => println!("unexpected response: {other:?}"),
    }
}
