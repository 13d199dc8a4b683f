//! Link envelope vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;

use serde::Deserialize;
use serde_json::Value;

use roomcast_core::protocol::frame::Frame;

#[derive(Debug, Deserialize)]
struct TestVector {
    description: String,
    frame: Value,
    #[serde(default)]
    expect: Option<Value>,
    #[serde(default)]
    expect_error: bool,
}

fn load(name: &str) -> TestVector {
    let s = fs::read_to_string(format!("tests/vectors/{name}")).unwrap();
    serde_json::from_str(&s).unwrap()
}

#[test]
fn frame_vectors() {
    let files = [
        "request_ping.json",
        "request_publish_presence.json",
        "response_ok.json",
        "response_timeout.json",
        "request_unknown_type.json",
        "frame_missing_ids.json",
    ];

    for f in files {
        let v = load(f);
        let raw = serde_json::to_string(&v.frame).unwrap();
        let res: Result<Frame, _> = serde_json::from_str(&raw);

        if v.expect_error {
            assert!(res.is_err(), "vector={}", v.description);
            continue;
        }

        let frame = res.expect("expected ok frame");
        let ex = v.expect.expect("missing expect block");

        match frame {
            Frame::Request(env) => {
                assert_eq!(ex["kind"].as_str().unwrap(), "request", "vector={}", v.description);
                assert_eq!(
                    env.request_id,
                    ex["requestId"].as_u64().unwrap(),
                    "vector={}",
                    v.description
                );
                assert_eq!(
                    env.request.kind(),
                    ex["requestKind"].as_str().unwrap(),
                    "vector={}",
                    v.description
                );
            }
            Frame::Response(env) => {
                assert_eq!(ex["kind"].as_str().unwrap(), "response", "vector={}", v.description);
                assert_eq!(
                    env.request_id,
                    ex["requestId"].as_u64().unwrap(),
                    "vector={}",
                    v.description
                );
                assert_eq!(
                    env.response.ok,
                    ex["ok"].as_bool().unwrap(),
                    "vector={}",
                    v.description
                );
                if let Some(status) = ex.get("status").and_then(|s| s.as_str()) {
                    assert_eq!(
                        env.response.status.map(|s| s.as_str()),
                        Some(status),
                        "vector={}",
                        v.description
                    );
                }
            }
        }
    }
}

#[test]
fn roundtrip_preserves_wire_names() {
    let v = load("request_publish_presence.json");
    let raw = serde_json::to_string(&v.frame).unwrap();
    let frame: Frame = serde_json::from_str(&raw).unwrap();
    let back = serde_json::to_value(&frame).unwrap();

    // camelCase field names are part of the wire contract.
    assert!(back.get("requestId").is_some());
    assert!(back.get("requestTimeMs").is_some());
    assert_eq!(back["request"]["type"].as_str().unwrap(), "publishPresence");
}
