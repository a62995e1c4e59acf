use panellink_protocol::{encode_message, Message, MessageParser};

fn main() {
    let msg: Message<64> = Message::new(1, 0, b"0;0").unwrap();
    let mut raw = [0u8; 128];
    let len = encode_message(&msg, &mut raw).unwrap();
    println!("frame: {}", String::from_utf8_lossy(&raw[..len]).trim_end());

    let mut parser: MessageParser<64> = MessageParser::new();
    for b in &raw[..len] {
        if let Some(decoded) = parser.push(*b).unwrap() {
            println!(
                "type {} seq {} payload {}",
                decoded.msg_type,
                decoded.seq,
                String::from_utf8_lossy(&decoded.payload)
            );
        }
    }
}
