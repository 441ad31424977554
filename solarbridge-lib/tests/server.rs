use json::JsonValue;
use std::{collections::BTreeSet, net::SocketAddr, time::Duration};
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

use solarbridge_lib::device::Device;
use solarbridge_lib::protocol::telegram::crc16;
use solarbridge_lib::protocol::vedirect::{encode_frame, COMMAND_GET};
use solarbridge_lib::protocol::ProtocolKind;
use solarbridge_lib::regs::{Reg, Registry, SENTINEL};
use solarbridge_lib::server::{ServerConfig, TelemetryServer};

fn telegram_reply(header: [u8; 3], payload: &[u8]) -> Vec<u8> {
    let mut frame = header.to_vec();
    frame.push(0xFF);
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Inverter answering the electric, temperature and threshold telegrams.
async fn fake_inverter(mut far: DuplexStream) -> usize {
    let telegrams = Registry::new(ProtocolKind::Telegram).telegrams();
    let mut requests = 0;
    let mut request = [0u8; 8];
    while far.read_exact(&mut request).await.is_ok() {
        requests += 1;
        let telegram = match telegrams.iter().find(|t| t.request == request) {
            Some(t) => t,
            None => continue,
        };
        let reply = match telegram.name {
            "getElectricParameters" => telegram_reply(
                telegram.reply_header,
                &[
                    0x0A, 0x28, 0, 0, 0, 0, 0, 0, 0x59, 0xD8, 0x00, 0x91, 0x01, 0x4D, 0, 0,
                ],
            ),
            "getTemperatures" => telegram_reply(telegram.reply_header, &[0x09, 0x92, 0, 0, 0, 0]),
            "getThresholds" => telegram_reply(
                telegram.reply_header,
                &[0x04, 0xB0, 0x05, 0x14, 0x05, 0xDC, 0x06, 0x40],
            ),
            _ => continue,
        };
        if far.write_all(&reply).await.is_err() {
            break;
        }
    }
    requests
}

fn hex_byte(chars: &[u8]) -> u8 {
    u8::from_str_radix(std::str::from_utf8(chars).unwrap(), 16).unwrap()
}

/// Charge controller with a pending error flag on `chargerErr`.
async fn fake_charger(far: DuplexStream) {
    let mut far = BufReader::new(far);
    let mut line = Vec::new();
    loop {
        line.clear();
        match far.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let (lo, hi) = (hex_byte(&line[2..4]), hex_byte(&line[4..6]));
        let (flags, value): (u8, Vec<u8>) = match u16::from_le_bytes([lo, hi]) {
            0xEDDB => (0, vec![0xC4, 0x09]),
            0xEDDA => (1, vec![0x00]),
            0xEDD7 => (0, vec![0x2A, 0x00]),
            0xEDD5 => (0, vec![0x48, 0x05]),
            0xEDBC => (0, vec![0x10, 0x27, 0x01, 0x00]),
            0xEDBB => (0, vec![0x6C, 0x07]),
            0xEDBD => (0, vec![0x05, 0x00]),
            0xEDB3 => (0, vec![0x02]),
            _ => continue,
        };
        let mut payload = vec![lo, hi, flags];
        payload.extend_from_slice(&value);
        let reply = encode_frame(COMMAND_GET, &payload);
        if far.get_mut().write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn start_server(kind: ProtocolKind, near: DuplexStream, regs: Vec<Reg>) -> SocketAddr {
    let (device, _) = Device::spawn(kind, near, kind.default_timeout());
    let server = TelemetryServer::new(device, regs, ServerConfig::new("127.0.0.1:0"));
    let listener: TcpListener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

async fn fetch(addr: SocketAddr, request: &[u8]) -> JsonValue {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();
    let mut body = String::new();
    client.read_to_string(&mut body).await.unwrap();
    json::parse(&body).unwrap()
}

fn keys(object: &JsonValue) -> BTreeSet<String> {
    object.entries().map(|(k, _)| k.to_string()).collect()
}

fn names(regs: &[Reg]) -> BTreeSet<String> {
    regs.iter().map(|reg| reg.name.to_string()).collect()
}

fn assert_close(value: &JsonValue, expected: f64) {
    let got = value.as_f64().unwrap();
    assert!((got - expected).abs() < 1e-9, "{} != {}", got, expected);
}

#[tokio::test]
async fn inverter_snapshot() {
    let (near, far) = duplex(1024);
    let inverter = tokio::spawn(fake_inverter(far));
    let regs = Registry::new(ProtocolKind::Telegram).default_subset();
    let addr = start_server(ProtocolKind::Telegram, near, regs.clone()).await;

    let reply = fetch(addr, b"read").await;
    assert_eq!(keys(&reply), names(&regs));
    assert_close(&reply["battVoltage"], 26.0);
    assert_close(&reply["outVoltage"], 230.0);
    assert_close(&reply["outCurrent"], 1.45);
    assert_close(&reply["outPower"], 3.33);
    assert_close(&reply["temperature"], 24.5);

    // a second client gets a fresh poll
    let again = fetch(addr, b"read").await;
    assert_eq!(again, reply);

    inverter.abort();
}

#[tokio::test]
async fn inverter_full_catalog() {
    let (near, far) = duplex(1024);
    let inverter = tokio::spawn(fake_inverter(far));
    let regs: Vec<Reg> = Registry::new(ProtocolKind::Telegram).iter().copied().collect();
    let addr = start_server(ProtocolKind::Telegram, near, regs.clone()).await;

    let reply = fetch(addr, b"read").await;
    assert_eq!(keys(&reply), names(&regs));
    assert_close(&reply["battVoltage"], 26.0);
    assert_close(&reply["temperature"], 24.5);
    assert_close(&reply["underVoltageThreshold"], 12.0);
    assert_close(&reply["underVoltageRecovery"], 13.0);
    assert_close(&reply["overVoltageRecovery"], 15.0);
    assert_close(&reply["overVoltageThreshold"], 16.0);

    inverter.abort();
}

#[tokio::test]
async fn charger_snapshot_with_flagged_register() {
    let (near, far) = duplex(1024);
    tokio::spawn(fake_charger(far));
    let regs = Registry::new(ProtocolKind::VeDirect).default_subset();
    let addr = start_server(ProtocolKind::VeDirect, near, regs.clone()).await;

    let reply = fetch(addr, b"read\n").await;
    assert_eq!(keys(&reply), names(&regs));
    assert_eq!(reply["chargerErr"].as_i64(), Some(SENTINEL));
    assert_close(&reply["chargerTemp"], 25.0);
    assert_close(&reply["chargerCurrent"], 4.2);
    assert_close(&reply["chargerVoltage"], 13.52);
    assert_close(&reply["panelPower"], 755.36);
    assert_close(&reply["panelVoltage"], 19.0);
    assert_close(&reply["panelCurrent"], 0.5);
    assert_eq!(reply["trackerMode"].as_i64(), Some(2));
}

#[tokio::test]
async fn empty_request_still_polls() {
    let (near, far) = duplex(1024);
    tokio::spawn(fake_charger(far));
    let regs = Registry::new(ProtocolKind::VeDirect)
        .select(&["chargerVoltage"])
        .unwrap();
    let addr = start_server(ProtocolKind::VeDirect, near, regs).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.shutdown().await.unwrap();
    let mut body = String::new();
    client.read_to_string(&mut body).await.unwrap();
    assert_eq!(body, r#"{"chargerVoltage":13.52}"#);
}

#[tokio::test]
async fn silent_device_yields_sentinels() {
    let (near, _far) = duplex(1024);
    let regs = Registry::new(ProtocolKind::Telegram).default_subset();
    let (device, _) = Device::spawn(ProtocolKind::Telegram, near, Duration::from_millis(20));
    let server = TelemetryServer::new(device, regs.clone(), ServerConfig::new("127.0.0.1:0"));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await });

    let reply = fetch(addr, b"read").await;
    assert_eq!(keys(&reply), names(&regs));
    for (_, value) in reply.entries() {
        assert_eq!(value.as_i64(), Some(SENTINEL));
    }
}
