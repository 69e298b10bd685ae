//! `RumqttTransport` against an in-process MQTT 3.1.1 broker on loopback.
//!
//! The broker pushes a burst of QoS 1 messages, larger than the client's
//! request channel would hold if acks were never drained, and counts the
//! PUBACKs that come back.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mqtt_timescale_bridge::config::BrokerConfig;
use mqtt_timescale_bridge::pipeline::Pipeline;
use mqtt_timescale_bridge::sink::MemorySink;
use mqtt_timescale_bridge::subscriber::{RumqttTransport, SubscriptionClient};

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH_QOS1: u8 = 0x32;
const PUBACK: u8 = 0x40;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;

const TOPIC: &str = "boat/signalk/delta";

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn publish_qos1(pkid: u16, topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(&pkid.to_be_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![PUBLISH_QOS1];
    encode_remaining_length(body.len(), &mut packet);
    packet.extend_from_slice(&body);
    packet
}

fn reading(n: u16) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "time": "2024-01-01T00:00:00Z",
        "context": format!("dev-{n}"),
        "path": "environment.outside.temperature",
        "value": f64::from(n)
    }))
    .unwrap()
}

/// Accept one client, hand out `burst` messages in a single write and return
/// the packet ids of every PUBACK once all of them have arrived.
async fn serve_burst(listener: TcpListener, burst: u16) -> BTreeSet<u16> {
    let (mut stream, _) = listener.accept().await.unwrap();

    let (header, _) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, CONNECT);
    stream.write_all(&[CONNACK, 0x02, 0x00, 0x00]).await.unwrap();

    let (header, body) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, SUBSCRIBE);
    stream
        .write_all(&[SUBACK, 0x03, body[0], body[1], 0x01])
        .await
        .unwrap();

    let mut burst_bytes = Vec::new();
    for pkid in 1..=burst {
        burst_bytes.extend(publish_qos1(pkid, TOPIC, &reading(pkid)));
    }
    stream.write_all(&burst_bytes).await.unwrap();

    let mut acked = BTreeSet::new();
    while acked.len() < usize::from(burst) {
        let (header, body) = read_packet(&mut stream).await.unwrap();
        match header {
            PUBACK => {
                acked.insert(u16::from_be_bytes([body[0], body[1]]));
            }
            PINGREQ => stream.write_all(&[PINGRESP, 0x00]).await.unwrap(),
            other => panic!("unexpected packet type {other:#04x}"),
        }
    }
    acked
}

fn broker_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".into(),
        port,
        username: None,
        password: None,
        topic: "+/signalk/delta".into(),
        client_id: "bridge-loopback-test".into(),
        keep_alive: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn every_message_in_a_burst_is_acked() {
    const BURST: u16 = 40;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = tokio::spawn(serve_burst(listener, BURST));

    let config = broker_config(port);
    let sink = MemorySink::new();
    let mut pipeline = Pipeline::new(sink.clone());
    let mut client = SubscriptionClient::new(
        RumqttTransport::new(&config),
        config.topic.clone(),
        config.reconnect_delay,
    );

    let acked = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::select! {
            r = client.run(&mut pipeline) => panic!("receive loop ended early: {r:?}"),
            acked = broker => acked.unwrap(),
        }
    })
    .await
    .expect("broker did not receive every PUBACK in time");

    assert_eq!(acked, (1..=BURST).collect::<BTreeSet<_>>());
    assert_eq!(pipeline.stats().stored, u64::from(BURST));
    assert_eq!(sink.len(), usize::from(BURST));
}
