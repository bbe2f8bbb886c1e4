//! DCC interception: outgoing offers are rewritten to advertise the
//! bouncer, and incoming sends can be captured with resume.

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use common::server::BouncerConfig;
use common::{ScriptedUpstream, TestBouncer, TestClient};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const LOOPBACK_INT: u32 = 2130706433; // 127.0.0.1 in DCC integer form

/// Pull `(addr, port)` out of a rewritten `DCC CHAT chat <addr> <port>`.
fn parse_chat_offer(line: &str) -> Option<(u32, u16)> {
    let inner = line.split('\x01').nth(1)?;
    let mut words = inner.split_whitespace().rev();
    let port = words.next()?.parse().ok()?;
    let addr = words.next()?.parse().ok()?;
    Some((addr, port))
}

#[tokio::test]
async fn test_outgoing_chat_offer_rewritten_and_bridged() {
    let upstream = ScriptedUpstream::bind().await.expect("bind upstream");
    let bouncer = TestBouncer::spawn(
        20106,
        BouncerConfig {
            password: "foo".to_owned(),
            servers: vec![upstream.address()],
            extra: String::new(),
        },
    )
    .await
    .expect("spawn bouncer");

    let mut client = TestClient::connect(&bouncer.address(), "alice")
        .await
        .expect("connect client");
    client.register("foo").await.expect("register");

    let mut conn = upstream.accept().await.expect("accept");
    conn.complete_registration("irc.test").await.expect("registration");
    client
        .recv_until(|l| l.contains(" 001 "))
        .await
        .expect("welcome");

    // The client (behind NAT, as far as anyone knows) offers a DCC CHAT
    // on a port it listens on itself
    let offer_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind offer");
    let offer_port = offer_listener.local_addr().expect("addr").port();
    client
        .send_raw(&format!(
            "PRIVMSG peer :\x01DCC CHAT chat {} {}\x01",
            LOOPBACK_INT, offer_port
        ))
        .await
        .expect("send offer");

    // Upstream sees the offer advertising the bouncer instead
    let forwarded = conn
        .recv_until(|l| l.contains("DCC CHAT"))
        .await
        .expect("rewritten offer");
    let (addr, advertised) = parse_chat_offer(&forwarded).expect("parse offer");
    assert_eq!(Ipv4Addr::from(addr), Ipv4Addr::LOCALHOST);
    assert_ne!(advertised, offer_port, "offer must not advertise the client's port");

    // The remote peer connects to the advertised port; the bouncer dials
    // the client's own listener and bridges the two
    let mut peer = TcpStream::connect(("127.0.0.1", advertised))
        .await
        .expect("peer connects to bouncer");
    let (client_side, _) = tokio::time::timeout(
        Duration::from_secs(10),
        offer_listener.accept(),
    )
    .await
    .expect("bouncer dialed the client")
    .expect("accept");

    peer.write_all(b"hello from peer\n").await.expect("peer write");

    let mut lines = BufReader::new(client_side).lines();
    loop {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("bridge delivered")
            .expect("read")
            .expect("open");
        // Progress banners from the bouncer may arrive first
        if line.contains("hello from peer") {
            break;
        }
        assert!(line.starts_with("--("), "unexpected chat line: {line}");
    }
}

#[tokio::test]
async fn test_incoming_send_captured_with_resume() {
    let capture_dir = tempfile::tempdir().expect("tempdir");
    let partial = capture_dir.path().join("file.bin");
    std::fs::write(&partial, vec![0x11u8; 4000]).expect("write partial");

    let upstream = ScriptedUpstream::bind().await.expect("bind upstream");
    let bouncer = TestBouncer::spawn(
        20107,
        BouncerConfig {
            password: "foo".to_owned(),
            servers: vec![upstream.address()],
            extra: format!(
                "dcc_capture_directory = \"{}\"\ndcc_capture_always = true",
                capture_dir.path().display()
            ),
        },
    )
    .await
    .expect("spawn bouncer");

    let mut client = TestClient::connect(&bouncer.address(), "alice")
        .await
        .expect("connect client");
    client.register("foo").await.expect("register");

    let mut conn = upstream.accept().await.expect("accept");
    conn.complete_registration("irc.test").await.expect("registration");
    client
        .recv_until(|l| l.contains(" 001 "))
        .await
        .expect("welcome");

    // A third party offers a 10000 byte file; 4000 bytes already exist
    let sender_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sender");
    let sender_port = sender_listener.local_addr().expect("addr").port();
    conn.send(&format!(
        ":dan!dan@host PRIVMSG alice :\x01DCC SEND file.bin {} {} 10000\x01",
        LOOPBACK_INT, sender_port
    ))
    .await
    .expect("send offer");

    // The bouncer negotiates a resume at our existing offset
    let resume = conn
        .recv_until(|l| l.contains("DCC RESUME"))
        .await
        .expect("resume request");
    assert!(
        resume.contains(&format!("file.bin {} 4000", sender_port)),
        "unexpected resume request: {resume}"
    );

    conn.send(&format!(
        ":dan!dan@host PRIVMSG alice :\x01DCC ACCEPT file.bin {} 4000\x01",
        sender_port
    ))
    .await
    .expect("accept resume");

    // The bouncer connects to the sender; deliver the remaining bytes
    let (mut transfer, _) = tokio::time::timeout(
        Duration::from_secs(10),
        sender_listener.accept(),
    )
    .await
    .expect("bouncer dialed the sender")
    .expect("accept");

    transfer.write_all(&vec![0xABu8; 6000]).await.expect("send data");
    transfer.flush().await.expect("flush");

    // Drain acknowledgements until the transfer is fully acked
    let mut acked = 0u32;
    let mut quad = [0u8; 4];
    while acked < 10000 {
        tokio::time::timeout(Duration::from_secs(10), transfer.read_exact(&mut quad))
            .await
            .expect("ack arrived")
            .expect("read ack");
        acked = u32::from_be_bytes(quad);
    }
    drop(transfer);

    // The capture resumed at byte 4000
    tokio::time::sleep(Duration::from_millis(500)).await;
    let contents = std::fs::read(&partial).expect("read capture");
    assert_eq!(contents.len(), 10000);
    assert!(contents[..4000].iter().all(|&b| b == 0x11));
    assert!(contents[4000..].iter().all(|&b| b == 0xAB));
}
