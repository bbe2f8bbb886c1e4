//! Client listener and pre-authentication handshake.
//!
//! The listener accepts TCP connections and runs each through the
//! registration exchange (PASS, NICK, USER in any order) before routing
//! it to a session: attaching to the live session of the matching class,
//! or creating one.  In inetd mode stdin/stdout are adopted as the sole
//! client instead.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use crate::registry::{Registry, Route};
use crate::session::{ClientHandoff, Control, Session};
use crate::PACKAGE;
use slbnc_proto::{sanitize_username, LineCodec, Message};

/// A client-facing byte stream: a TCP connection, or the process's
/// stdin/stdout when running from inetd.
pub enum ClientStream {
    Tcp(TcpStream),
    Stdio(tokio::io::Join<Stdin, Stdout>),
}

impl ClientStream {
    /// Adopt stdin/stdout as the client.
    pub fn stdio() -> Self {
        ClientStream::Stdio(tokio::io::join(tokio::io::stdin(), tokio::io::stdout()))
    }

    /// Our address as the client sees it, when there is a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ClientStream::Tcp(stream) => stream.local_addr().ok(),
            ClientStream::Stdio(_) => None,
        }
    }

    /// The client's address, when there is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            ClientStream::Tcp(stream) => stream.peer_addr().ok(),
            ClientStream::Stdio(_) => None,
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Stdio(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Stdio(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Stdio(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Stdio(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// The client TCP listener.
pub struct Listener {
    inner: TcpListener,
    registry: Arc<Registry>,
}

impl Listener {
    /// Bind the listen socket.  `spec` is a bare port or `host:port`.
    pub async fn bind(spec: &str, registry: Arc<Registry>) -> std::io::Result<Listener> {
        let addr: SocketAddr = if let Ok(port) = spec.parse::<u16>() {
            SocketAddr::from(([0, 0, 0, 0], port))
        } else if let Ok(addr) = spec.parse::<SocketAddr>() {
            addr
        } else {
            // host:port with a name for the host part
            let (host, port) = spec.rsplit_once(':').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad listen address '{spec}'"),
                )
            })?;
            let port: u16 = port.parse().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad listen port '{port}'"),
                )
            })?;
            let ip = registry.resolver.resolve_host(host).await.ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve '{host}'"),
                )
            })?;
            SocketAddr::new(ip, port)
        };

        let inner = TcpListener::bind(addr).await?;
        info!(%addr, "Listening for client connections");
        Ok(Listener { inner, registry })
    }

    /// The port actually bound.
    pub fn port(&self) -> Option<u16> {
        self.inner.local_addr().ok().map(|a| a.port())
    }

    /// Accept clients until shutdown.
    pub async fn run(self) {
        let mut shutdown = self.registry.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Client connection accepted");
                        let registry = Arc::clone(&self.registry);
                        tokio::spawn(async move {
                            preauth(ClientStream::Tcp(stream), registry, false).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
    }
}

/// Run the sole inherited client in inetd mode.  Returns when the
/// session (if any was created) has ended.
pub async fn run_inetd(registry: Arc<Registry>) {
    if let Some(task) = preauth(ClientStream::stdio(), registry, true).await {
        let _ = task.await;
    }
}

/// The pre-authentication handshake: collect PASS, NICK and USER, check
/// them against the connection classes, and hand the stream to its
/// session.
async fn preauth(
    stream: ClientStream,
    registry: Arc<Registry>,
    die_on_close: bool,
) -> Option<tokio::task::JoinHandle<()>> {
    let peer = stream.peer_addr();
    let ip = peer
        .map(|p| p.ip().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_owned());
    let mut framed = Framed::new(stream, LineCodec::new());

    let notice = |text: &str, nick: &str| format!(":{} NOTICE {} :{}", PACKAGE, nick, text);

    let _ = framed
        .send(notice("Looking up your hostname...", "AUTH"))
        .await;
    let host = match peer {
        Some(addr) => registry
            .resolver
            .resolve_addr(addr.ip())
            .await
            .unwrap_or_else(|| ip.clone()),
        None => ip.clone(),
    };
    let _ = framed.send(notice("Got your hostname.", "AUTH")).await;

    let mut password: Option<String> = None;
    let mut nickname: Option<String> = None;
    let mut user: Option<(String, String, Vec<char>)> = None;

    let timeout = Duration::from_secs(registry.globals().client_timeout);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let line = match tokio::time::timeout_at(deadline, framed.next()).await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Client read error during login");
                return None;
            }
            Ok(None) => {
                debug!("Client disconnected during login");
                return None;
            }
            Err(_) => {
                debug!("Login timed out");
                let _ = framed
                    .send("ERROR :Closing Link: [unknown] (Login Timeout)".to_owned())
                    .await;
                return None;
            }
        };

        let Ok(msg) = Message::parse(&line) else {
            continue;
        };
        let nick_label = nickname.clone().unwrap_or_else(|| "AUTH".to_owned());

        match msg.command.to_ascii_uppercase().as_str() {
            "PASS" => match msg.param(0) {
                Some(p) => password = Some(p.to_owned()),
                None => {
                    let _ = framed
                        .send(format!(
                            ":{} 461 {} :Not enough parameters",
                            PACKAGE,
                            nickname.as_deref().unwrap_or("*")
                        ))
                        .await;
                }
            },
            "NICK" => match msg.param(0) {
                Some(n) => nickname = Some(n.to_owned()),
                None => {
                    let _ = framed
                        .send(format!(
                            ":{} 431 {} :No nickname given",
                            PACKAGE,
                            nickname.as_deref().unwrap_or("*")
                        ))
                        .await;
                }
            },
            "USER" => {
                if msg.params.len() >= 4 {
                    if user.is_none() {
                        // The second parameter is the RFC 2812 initial
                        // user mode bitmask
                        let mode: u32 = msg.params[1].parse().unwrap_or(0);
                        let mut request_modes = Vec::new();
                        if mode & 0x04 != 0 {
                            request_modes.push('w');
                        }
                        if mode & 0x08 != 0 {
                            request_modes.push('i');
                        }
                        user = Some((
                            sanitize_username(&msg.params[0]),
                            msg.params[3].clone(),
                            request_modes,
                        ));
                    }
                } else {
                    let _ = framed
                        .send(format!(
                            ":{} 461 {} :Not enough parameters",
                            PACKAGE,
                            nickname.as_deref().unwrap_or("*")
                        ))
                        .await;
                }
            }
            _ if password.is_none() => {
                let _ = framed
                    .send(notice(
                        "Please send /QUOTE PASS <password> to login",
                        &nick_label,
                    ))
                    .await;
            }
            _ => {
                let _ = framed
                    .send(notice("Please send /QUOTE NICK and /QUOTE USER", &nick_label))
                    .await;
            }
        }

        if password.is_some() && nickname.is_some() && user.is_some() {
            break;
        }
    }

    let (password, nickname) = match (password, nickname.clone()) {
        (Some(p), Some(n)) => (p, n),
        _ => return None,
    };
    let Some((username, realname, request_modes)) = user else {
        return None;
    };

    let Some(class) = registry.authenticate(&password, &ip, &host) else {
        info!(%ip, "Authentication failed");
        let _ = framed
            .send(format!(
                ":{} 464 {} :You are not permitted to use this proxy",
                PACKAGE, nickname
            ))
            .await;
        let _ = framed
            .send(format!(
                "ERROR :Closing Link: {}[{}@{}] (Permission Denied)",
                nickname, username, host
            ))
            .await;
        return None;
    };

    let handoff = ClientHandoff {
        framed,
        host,
        nickname,
        username,
        realname,
        request_modes,
    };

    match registry.route(&class) {
        Route::Existing(handle) => {
            debug!("Routing client to existing session");
            if handle
                .control
                .send(Control::Attach(Box::new(handoff)))
                .await
                .is_err()
            {
                debug!("Session disappeared while attaching");
            }
            None
        }
        Route::Created(handle, control_rx) => {
            debug!("Creating session for class");
            Some(Session::launch(
                registry.clone(),
                class,
                handle,
                control_rx,
                handoff,
                die_on_close,
            ))
        }
    }
}
