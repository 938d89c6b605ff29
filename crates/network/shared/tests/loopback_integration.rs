//! Integration test for the loopback transporter and the handshake frame codec.
//!
//! Verifies that both halves exchange raw packets and length-prefixed frames
//! in the same process with zero network I/O.

use bytes::Bytes;
use network_shared::prelude::*;
use network_shared::transport::LossPattern;
use test_log::test;

#[test]
fn test_loopback_frames_same_process() {
    let (mut client, mut server) = LoopbackPair::connected().split();
    let codec = FrameCodec::new(4096);

    let hello = Frame::Handshake(HandshakeFrame::ClientHello {
        version: 1,
        compression: vec![CompressionKind::None],
        encryption: vec![EncryptionKind::None],
    });
    client
        .send(Bytes::from(codec.encode_to_vec(&hello).unwrap()))
        .unwrap();

    let mut decoder = FrameDecoder::new(4096);
    while let Some(packet) = server.poll_received() {
        decoder.push_bytes(&packet);
    }
    let frame = decoder.next_frame().unwrap().expect("hello frame");
    assert!(frame.is_client_hello());
    assert_eq!(decoder.buffered_len(), 0);
}

#[test]
fn test_loopback_multiple_messages() {
    let (mut client, mut server) = LoopbackPair::connected().split();

    let count = 100;
    for i in 0..count {
        client.send(Bytes::from(format!("C2S {}", i))).unwrap();
        server.send(Bytes::from(format!("S2C {}", i))).unwrap();
    }

    let server_received = server.drain_received();
    let client_received = client.drain_received();
    assert_eq!(server_received.len(), count);
    assert_eq!(client_received.len(), count);

    // Verify message order is preserved
    for (i, payload) in server_received.iter().enumerate() {
        assert_eq!(payload.as_ref(), format!("C2S {}", i).as_bytes());
    }
    for (i, payload) in client_received.iter().enumerate() {
        assert_eq!(payload.as_ref(), format!("S2C {}", i).as_bytes());
    }
}

#[test]
fn test_loopback_total_loss_is_reported() {
    let (mut client, server) = LoopbackPair::connected().split();
    client.set_loss(LossPattern::All);
    for _ in 0..4 {
        client.send(Bytes::from_static(b"gone")).unwrap();
    }
    assert_eq!(server.pending_received(), 0);
    let stats = client.link_stats();
    assert_eq!(stats.packets_sent, 4);
    assert_eq!(stats.packets_lost, 4);
}

#[test]
fn test_loopback_fault_stops_traffic() {
    let (mut client, server) = LoopbackPair::connected().split();
    server.fault();
    assert_eq!(client.state(), TransporterState::Faulted);
    assert!(client.state().is_terminal());
    assert!(matches!(
        client.send(Bytes::from_static(b"x")),
        Err(TransportError::Faulted(_))
    ));
}
