//! DCC proxy tasks.
//!
//! A DCC proxy stands between the offering party (the "sender") and the
//! party the rewritten offer points at (the "sendee").  The proxy dials
//! the sender and, except when capturing, listens for the sendee on a
//! local port chosen from the configured ranges; that port is what the
//! rewritten CTCP advertises.  Each proxy runs as its own task and
//! reports failure back to its owning session over a channel.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::session::DccEvent;
use crate::PACKAGE;

/// Size of the chunks used when relaying a DCC SEND.  Not strictly
/// honored by anyone, including us.
const DCC_BLOCK_SIZE: usize = 2048;

/// What a DCC proxy does with its two ends.
#[derive(Clone, Debug)]
pub enum DccTaskKind {
    /// Bridge chat lines between the two parties.
    Chat,
    /// Relay a file transfer, pacing on the sendee's acknowledgements.
    SendSimple,
    /// Relay a file transfer as fast as the socket allows.
    SendFast,
    /// No sendee at all: write the transfer into a file.
    Capture {
        /// Where the file is written.
        path: PathBuf,
        /// Resume offset (0 for a fresh capture).
        resume_from: u64,
    },
}

/// Everything needed to set up a proxy.
pub struct DccRequest {
    /// Proxy flavour.
    pub kind: DccTaskKind,
    /// The offering party's advertised endpoint.
    pub remote: SocketAddrV4,
    /// Local port ranges to bind in, `None` for any free port.
    pub ports: Option<Vec<(u16, u16)>>,
    /// How long both ends have to become active.
    pub timeout: Duration,
    /// Capture size limit in KB (0 = no limit).
    pub capture_maxsize_kb: u64,
    /// Channel back to the owning session.
    pub events: mpsc::Sender<DccEvent>,
    /// Pre-formatted DCC REJECT notice (without closing delimiter).
    pub reject_notice: String,
    /// Whether the rejection is relayed upstream or to the client.
    pub reject_to_server: bool,
}

impl DccRequest {
    async fn reject(&self, reason: &str) {
        let _ = self
            .events
            .send(DccEvent::Reject {
                notice: self.reject_notice.clone(),
                reason: Some(reason.to_owned()),
                to_server: self.reject_to_server,
            })
            .await;
    }
}

/// Set up a proxy and return the local port to advertise in the
/// rewritten offer.  The listening socket (or, for captures, the capture
/// file) is prepared before returning so setup errors reach the caller;
/// the transfer itself runs in a background task.
pub async fn spawn(request: DccRequest) -> std::io::Result<u16> {
    match request.kind {
        DccTaskKind::Capture { .. } => spawn_capture(request).await,
        DccTaskKind::Chat => spawn_proxy(request, true).await,
        DccTaskKind::SendSimple | DccTaskKind::SendFast => spawn_proxy(request, false).await,
    }
}

async fn spawn_proxy(request: DccRequest, chat: bool) -> std::io::Result<u16> {
    let (listener, port) = listen_in_range(&request.ports)?;
    debug!(port, "Listening for DCC sendee");

    tokio::spawn(async move {
        if chat {
            run_chat(request, listener).await;
        } else {
            run_send(request, listener).await;
        }
    });

    Ok(port)
}

async fn spawn_capture(request: DccRequest) -> std::io::Result<u16> {
    let DccTaskKind::Capture { ref path, resume_from } = request.kind else {
        return Err(std::io::Error::other("not a capture"));
    };

    // Fresh captures truncate; resumes append to what is already there
    let file = if resume_from > 0 {
        std::fs::OpenOptions::new().append(true).create(true).open(path)?
    } else {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?
    };
    let file = File::from_std(file);
    debug!(path = %path.display(), resume_from, "Capturing DCC transfer");

    tokio::spawn(async move {
        run_capture(request, file).await;
    });

    // No sendee will connect; the port is never advertised
    Ok(0)
}

/// Bind a listening socket within the configured ranges.
fn listen_in_range(ports: &Option<Vec<(u16, u16)>>) -> std::io::Result<(TcpListener, u16)> {
    let bind_one = |port: u16| -> std::io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        socket.listen(16)
    };

    match ports {
        Some(ranges) => {
            for (low, high) in ranges {
                for port in *low..=*high {
                    if let Ok(listener) = bind_one(port) {
                        return Ok((listener, port));
                    }
                }
            }
            Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "no free ports in the configured DCC ranges",
            ))
        }
        None => {
            let listener = bind_one(0)?;
            let port = listener.local_addr()?.port();
            Ok((listener, port))
        }
    }
}

/// Dial the sender, binding in the port ranges when possible (falling
/// back to an ephemeral port).
async fn connect_sender(
    remote: SocketAddrV4,
    ports: &Option<Vec<(u16, u16)>>,
) -> std::io::Result<TcpStream> {
    debug!(%remote, "Connecting to DCC sender");
    if let Some(ranges) = ports {
        for (low, high) in ranges {
            for port in *low..=*high {
                let Ok(socket) = TcpSocket::new_v4() else { continue };
                if socket
                    .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                    .is_ok()
                {
                    return socket.connect(SocketAddr::V4(remote)).await;
                }
            }
        }
    }
    TcpStream::connect(SocketAddr::V4(remote)).await
}

async fn read_into(stream: &mut Option<TcpStream>, buf: &mut BytesMut) -> std::io::Result<usize> {
    match stream {
        Some(s) => s.read_buf(buf).await,
        None => std::future::pending().await,
    }
}

async fn accept_once(
    listener: &mut Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

/// The SEND relay: read from the sender, acknowledge every byte back to
/// it, and pump the buffer to the sendee either in acknowledged blocks
/// (simple) or as fast as the socket allows (fast).
async fn run_send(request: DccRequest, listener: TcpListener) {
    let fast = matches!(request.kind, DccTaskKind::SendFast);

    let mut listener = Some(listener);
    let mut sender: Option<TcpStream> = None;
    let mut sendee: Option<TcpStream> = None;
    let mut connecting = true;

    let mut buf = BytesMut::with_capacity(8192);
    let mut bytes_rcvd: u64 = 0;
    let mut bytes_sent: u64 = 0;
    let mut bytes_ackd: u64 = 0;
    let mut ack_buf = BytesMut::with_capacity(8);
    let mut sender_gone = false;

    let deadline = Instant::now() + request.timeout;
    let mut timeout_armed = true;

    let connect = connect_sender(request.remote, &request.ports);
    tokio::pin!(connect);

    loop {
        tokio::select! {
            result = connect.as_mut(), if connecting => {
                connecting = false;
                match result {
                    Ok(stream) => {
                        debug!("DCC connection succeeded");
                        sender = Some(stream);
                    }
                    Err(e) => {
                        debug!(error = %e, "DCC connection failed");
                        return;
                    }
                }
            }

            accepted = accept_once(&mut listener) => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "DCC sendee connected");
                        listener = None;
                        sendee = Some(stream);
                    }
                    Err(_) => return,
                }
            }

            read = read_into(&mut sender, &mut buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        // Not necessarily bad; the sender may just be done
                        sender = None;
                        if !buf.is_empty() {
                            debug!("Sender gone with data still queued");
                            sender_gone = true;
                        } else {
                            return;
                        }
                    }
                    Ok(n) => {
                        bytes_rcvd += n as u64;
                        let ack = (bytes_rcvd as u32).to_be_bytes();
                        if let Some(s) = sender.as_mut() {
                            if s.write_all(&ack).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            read = read_into(&mut sendee, &mut ack_buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!("Sendee disconnected");
                        return;
                    }
                    Ok(_) => {
                        // The sendee only ever sends 4-byte running totals
                        while ack_buf.len() >= 4 {
                            let mut quad = [0u8; 4];
                            quad.copy_from_slice(&ack_buf[..4]);
                            ack_buf.advance(4);
                            bytes_ackd = u32::from_be_bytes(quad) as u64;
                        }
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline), if timeout_armed => {
                timeout_armed = false;
                if sendee.is_none() {
                    request.reject("Timed out awaiting connection from peer").await;
                    return;
                } else if sender.is_none() && !sender_gone {
                    request.reject("Connection to peer timed out").await;
                    return;
                }
            }
        }

        // Move whatever the mode allows
        while !buf.is_empty() && sendee.is_some() && (fast || bytes_ackd >= bytes_sent) {
            let n = if fast {
                buf.len()
            } else {
                buf.len().min(DCC_BLOCK_SIZE)
            };
            let chunk = buf.split_to(n);
            if let Some(s) = sendee.as_mut() {
                if s.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            bytes_sent += n as u64;
            if !fast {
                break;
            }
        }

        if buf.is_empty() && sender_gone {
            debug!("Transfer drained after sender left");
            return;
        }
    }
}

/// Capture loop: no sendee, everything read goes to the file.
async fn run_capture(request: DccRequest, mut file: File) {
    let DccTaskKind::Capture { ref path, resume_from } = request.kind else {
        return;
    };
    let path = path.clone();
    let max_bytes = request.capture_maxsize_kb * 1024;

    let deadline = Instant::now() + request.timeout;
    let mut timeout_armed = true;

    let mut sender = match tokio::time::timeout_at(
        deadline,
        connect_sender(request.remote, &request.ports),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(error = %e, "DCC capture connection failed");
            request.reject("Connection to peer failed").await;
            remove_fresh_partial(&path, resume_from, 0);
            return;
        }
        Err(_) => {
            debug!("DCC capture connection timed out");
            request.reject("Connection to peer timed out").await;
            remove_fresh_partial(&path, resume_from, 0);
            return;
        }
    };

    let mut bytes_rcvd = resume_from;
    let mut written: u64 = 0;
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let read = tokio::select! {
            read = sender.read_buf(&mut buf) => read,
            _ = tokio::time::sleep_until(deadline), if timeout_armed => {
                // Connected and capturing; the completion timer is moot
                timeout_armed = false;
                continue;
            }
        };

        match read {
            Ok(0) | Err(_) => {
                // Sender finished (or vanished); keep what we have
                let _ = file.flush().await;
                debug!(path = %path.display(), written, "Capture closed");
                return;
            }
            Ok(n) => {
                bytes_rcvd += n as u64;
                let chunk = buf.split();
                if file.write_all(&chunk).await.is_err() {
                    request.reject("Couldn't write capture file").await;
                    return;
                }
                written += n as u64;

                if max_bytes > 0 && resume_from + written >= max_bytes {
                    debug!("Capture exceeded the size limit, removing");
                    let _ = tokio::fs::remove_file(&path).await;
                    return;
                }

                let ack = (bytes_rcvd as u32).to_be_bytes();
                if sender.write_all(&ack).await.is_err() {
                    let _ = file.flush().await;
                    return;
                }
            }
        }
    }
}

/// A failed fresh capture leaves no empty file behind; a failed resume
/// keeps the partial data it was trying to extend.
fn remove_fresh_partial(path: &std::path::Path, resume_from: u64, written: u64) {
    if resume_from == 0 && written == 0 {
        let _ = std::fs::remove_file(path);
    }
}

/// Chat bridge: both ends exchange lines, with progress banners from the
/// bouncer while one side is still missing.
async fn run_chat(request: DccRequest, listener: TcpListener) {
    let deadline = Instant::now() + request.timeout;

    let mut listener = Some(listener);
    let mut sender: Option<TcpStream> = None;
    let mut sendee: Option<TcpStream> = None;
    let mut connecting = true;

    let connect = connect_sender(request.remote, &request.ports);
    tokio::pin!(connect);

    // Wait for both ends (or give up at the deadline)
    while sender.is_none() || sendee.is_none() {
        tokio::select! {
            result = connect.as_mut(), if connecting => {
                connecting = false;
                match result {
                    Ok(mut stream) => {
                        if sendee.is_none() {
                            let _ = banner(&mut stream, "Awaiting connection from remote peer").await;
                        } else if let Some(s) = sendee.as_mut() {
                            let _ = banner(s, "Connected to remote peer").await;
                        }
                        sender = Some(stream);
                    }
                    Err(e) => {
                        debug!(error = %e, "DCC chat connection failed");
                        if let Some(s) = sendee.as_mut() {
                            let _ = banner(s, "Connection to remote peer failed").await;
                        }
                        request.reject("Connection to remote peer failed").await;
                        return;
                    }
                }
            }

            accepted = accept_once(&mut listener) => {
                match accepted {
                    Ok((mut stream, peer)) => {
                        debug!(%peer, "DCC chat sendee connected");
                        listener = None;
                        if sender.is_none() {
                            let _ = banner(&mut stream, "Connecting to remote peer").await;
                        } else if let Some(s) = sender.as_mut() {
                            let _ = banner(s, "Remote peer connected").await;
                        }
                        sendee = Some(stream);
                    }
                    Err(_) => return,
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                if sendee.is_none() {
                    if let Some(s) = sender.as_mut() {
                        let _ = banner(s, "Timed out awaiting connection from remote peer").await;
                    }
                } else if let Some(s) = sendee.as_mut() {
                    let _ = banner(s, "Connection to remote peer timed out").await;
                }
                return;
            }
        }
    }

    let (Some(sender), Some(sendee)) = (sender, sendee) else {
        return;
    };
    bridge_lines(sender, sendee).await;
}

async fn banner(stream: &mut TcpStream, text: &str) -> std::io::Result<()> {
    stream
        .write_all(format!("--({})-- {}\n", PACKAGE, text).as_bytes())
        .await
}

/// Copy chat lines in both directions until either side closes.
async fn bridge_lines(sender: TcpStream, sendee: TcpStream) {
    let (sender_read, sender_write) = sender.into_split();
    let (sendee_read, sendee_write) = sendee.into_split();

    let mut a = BufReader::new(sender_read).lines();
    let mut b = BufReader::new(sendee_read).lines();
    let mut to_sendee = sendee_write;
    let mut to_sender = sender_write;

    loop {
        tokio::select! {
            line = a.next_line() => {
                if !forward_line(line, &mut to_sendee).await {
                    return;
                }
            }
            line = b.next_line() => {
                if !forward_line(line, &mut to_sender).await {
                    return;
                }
            }
        }
    }
}

async fn forward_line(
    line: std::io::Result<Option<String>>,
    to: &mut OwnedWriteHalf,
) -> bool {
    match line {
        Ok(Some(text)) => to
            .write_all(format!("{}\n", text).as_bytes())
            .await
            .is_ok(),
        _ => false,
    }
}
