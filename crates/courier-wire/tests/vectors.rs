use bytes::Bytes;
use courier_wire::{Envelope, EnvelopeHeader, HEADER_LEN};
use serde_json::Value;
use std::fs;

fn envelope_from(value: &Value) -> Envelope {
    let body = || Bytes::from(hex_to_bytes(value["body_hex"].as_str().expect("body_hex")));
    let path = || value["path"].as_str().expect("path").to_string();
    match value["kind"].as_str().expect("kind") {
        "call" => Envelope::Call {
            path: path(),
            body: body(),
        },
        "open_stream" => Envelope::OpenStream {
            path: path(),
            body: body(),
        },
        "chunk" => Envelope::Chunk { body: body() },
        "reply" => Envelope::Reply { body: body() },
        "status" => Envelope::Status {
            error: serde_json::from_value(value["error"].clone()).expect("error"),
        },
        other => panic!("unknown envelope kind {other}"),
    }
}

#[test]
fn vectors_match_envelope_encoding() {
    let dir = "tests/vectors";
    let mut seen = 0;
    for entry in fs::read_dir(dir).expect("read vectors dir") {
        let path = entry.expect("entry").path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        seen += 1;
        let contents = fs::read_to_string(&path).expect("read vector");
        let value: Value = serde_json::from_str(&contents).expect("json");
        let envelope = envelope_from(&value["envelope"]);
        let frame = Bytes::from(hex_to_bytes(value["frame_hex"].as_str().expect("frame_hex")));

        assert_eq!(
            envelope.encode().expect("encode").as_ref(),
            frame.as_ref(),
            "encoding mismatch for {path:?}"
        );

        let header_bytes: &[u8; HEADER_LEN] = frame[..HEADER_LEN].try_into().expect("header");
        let header = EnvelopeHeader::parse(header_bytes).expect("header");
        assert_eq!(header.kind, envelope.kind(), "kind mismatch for {path:?}");
        assert_eq!(header.length as usize, frame.len() - HEADER_LEN);
        let decoded = Envelope::decode(header.kind, frame.slice(HEADER_LEN..)).expect("decode");
        assert_eq!(decoded, envelope, "decode mismatch for {path:?}");
    }
    assert!(seen > 0, "no vectors found in {dir}");
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len().is_multiple_of(2), "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| (from_hex_char(pair[0]) << 4) | from_hex_char(pair[1]))
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
