use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ac4qgp"))
}

fn tmp_path(name: &str) -> PathBuf {
    let tmp_dir = std::env::temp_dir().join("ac4qgp-cli-tests");
    fs::create_dir_all(&tmp_dir).ok();
    tmp_dir.join(name)
}

fn run_ac4qgp(args: &[&str]) -> Output {
    Command::new(binary())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute ac4qgp")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn combined(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string() + &stdout(output)
}

#[test]
fn test_encode_writes_wav() {
    let wav = tmp_path("encode_writes.wav");
    let output = run_ac4qgp(&["encode", wav.to_str().unwrap(), "-t", "hi"]);
    assert!(output.status.success(), "encode failed: {}", combined(&output));
    assert!(stdout(&output).contains("Encoded"));

    // 100 ms lead plus one 10240-sample chunk
    let reader = hound::WavReader::open(&wav).expect("Output file not created");
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, 48_000);
    assert_eq!(reader.duration(), 4800 + 10240);
}

#[test]
fn test_encode_decode_roundtrip() {
    let wav = tmp_path("roundtrip.wav");
    let output = run_ac4qgp(&[
        "encode",
        wav.to_str().unwrap(),
        "--command",
        "call",
        "--text",
        "A",
        "--seq-nr",
        "0",
        "--lead-ms",
        "37",
    ]);
    assert!(output.status.success(), "encode failed: {}", combined(&output));

    let output = run_ac4qgp(&["decode", wav.to_str().unwrap()]);
    assert!(output.status.success(), "decode failed: {}", combined(&output));
    let text = stdout(&output);
    assert!(text.contains("CALL sn=0 sna=0"), "got: {}", text);
    assert!(text.contains("data=\"A\""), "got: {}", text);
    assert!(text.contains("Decoded 1 telegrams (0 receive errors)"), "got: {}", text);
}

#[test]
fn test_band_passed_roundtrip() {
    let wav = tmp_path("band_pass.wav");
    let output = run_ac4qgp(&[
        "encode",
        wav.to_str().unwrap(),
        "-c",
        "call",
        "-t",
        "filtered",
        "--seq-nr",
        "0",
        "--band-pass",
    ]);
    assert!(output.status.success(), "encode failed: {}", combined(&output));

    let output = run_ac4qgp(&["decode", wav.to_str().unwrap(), "--band-pass"]);
    assert!(output.status.success(), "decode failed: {}", combined(&output));
    let text = stdout(&output);
    assert!(text.contains("data=\"filtered\""), "got: {}", text);
    assert!(text.contains("Decoded 1 telegrams"), "got: {}", text);
}

#[test]
fn test_decode_json() {
    let wav = tmp_path("decode_json.wav");
    let output = run_ac4qgp(&[
        "encode",
        wav.to_str().unwrap(),
        "-c",
        "none",
        "--seq-nr",
        "7",
        "--seq-nr-ack",
        "3",
        "--ack",
        "--channel",
        "3",
    ]);
    assert!(output.status.success(), "encode failed: {}", combined(&output));

    let output = run_ac4qgp(&[
        "decode",
        wav.to_str().unwrap(),
        "--json",
        "--last-acked",
        "7",
        "--channel",
        "3",
    ]);
    assert!(output.status.success(), "decode failed: {}", combined(&output));
    let decoded: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let telegrams = decoded.as_array().unwrap();
    assert_eq!(telegrams.len(), 1);
    assert_eq!(telegrams[0]["command"], "NONE");
    assert_eq!(telegrams[0]["seq_nr_ack"], 3);
    assert_eq!(telegrams[0]["ack"], true);
    assert_eq!(telegrams[0]["repeated"], true);
}

#[test]
fn test_decode_on_wrong_channel_finds_nothing() {
    let wav = tmp_path("wrong_channel.wav");
    let output = run_ac4qgp(&["encode", wav.to_str().unwrap(), "-c", "call", "--seq-nr", "0"]);
    assert!(output.status.success(), "encode failed: {}", combined(&output));

    let output = run_ac4qgp(&["decode", wav.to_str().unwrap(), "--channel", "0"]);
    assert!(output.status.success(), "decode failed: {}", combined(&output));
    assert!(stdout(&output).contains("Decoded 0 telegrams"));
}

#[test]
fn test_encode_rejects_long_payload() {
    let wav = tmp_path("too_long.wav");
    let output = run_ac4qgp(&["encode", wav.to_str().unwrap(), "-t", &"x".repeat(20)]);
    assert!(!output.status.success());
    let text = combined(&output);
    assert!(text.contains("20") && text.contains("19"), "got: {}", text);
}

#[test]
fn test_invalid_channel_is_rejected() {
    let wav = tmp_path("invalid_channel.wav");
    let output = run_ac4qgp(&["encode", wav.to_str().unwrap(), "--channel", "1"]);
    assert!(!output.status.success());
    assert!(combined(&output).contains("frequency channel 1"));
}

#[test]
fn test_channels_json() {
    let output = run_ac4qgp(&["channels", "--json"]);
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[5]["one_hz"], 1200);
    assert_eq!(rows[5]["zero_hz"], 2400);
    assert_eq!(rows[1]["allowed"], false);
}

#[test]
fn test_chat_over_loopback() {
    let output = run_ac4qgp(&["chat", "--json", "--speed", "2", "-m", "ping"]);
    assert!(output.status.success(), "chat failed: {}", combined(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["delivered"][0], "ping");
    assert_eq!(report["reply"], "got 1 message(s)");
    assert_eq!(report["call_ended"], true);
    assert_eq!(report["caller"]["partner"], "bob");
    assert_eq!(report["callee"]["partner"], "alice");
    assert_eq!(report["caller"]["session_code"], report["callee"]["session_code"]);
}
