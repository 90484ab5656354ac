//! TCP listener for inbound transfers.
//!
//! Binds an ephemeral port (dual-stack where the host allows it) and hands
//! every accepted connection to the supervisor over a bounded channel.
//! Accept errors go out on a second channel and the loop keeps running.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BACKLOG: i32 = 128;
const CHANNEL_CAPACITY: usize = 32;

/// A running acceptor.
#[derive(Debug)]
pub struct Acceptor {
    /// The port peers should dial, advertised in our SRV record.
    pub port: u16,
    pub connections: mpsc::Receiver<(TcpStream, SocketAddr)>,
    pub errors: mpsc::Receiver<io::Error>,
    pub task: JoinHandle<()>,
}

/// Start listening. Both channels close once `cancel` fires.
pub fn start(cancel: CancellationToken) -> Result<Acceptor> {
    let listener = match make_listener_socket(true) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!(error = %e, "dual-stack listener unavailable, using IPv4");
            make_listener_socket(false)?
        }
    };
    let listener = TcpListener::from_std(listener).context("register listener")?;
    let port = listener.local_addr().context("local_addr()")?.port();
    tracing::info!(port, "accepting transfers");

    let (conn_tx, connections) = mpsc::channel(CHANNEL_CAPACITY);
    let (err_tx, errors) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(accept_loop(listener, conn_tx, err_tx, cancel));

    Ok(Acceptor {
        port,
        connections,
        errors,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    conn_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    err_tx: mpsc::Sender<io::Error>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "connection accepted");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = conn_tx.send((stream, addr)) => {
                        if sent.is_err() {
                            tracing::debug!("supervisor gone, acceptor stopping");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                if let Err(e) = err_tx.try_send(e) {
                    tracing::debug!(error = %e, "accept error dropped");
                }
            }
        }
    }
    tracing::info!("acceptor stopped");
}

fn make_listener_socket(dual_stack: bool) -> Result<std::net::TcpListener> {
    let (domain, bind_addr): (Domain, SocketAddr) = if dual_stack {
        (Domain::IPV6, SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into())
    } else {
        (Domain::IPV4, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if dual_stack {
        socket.set_only_v6(false).context("IPV6_V6ONLY")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket.listen(BACKLOG).context("listen()")?;

    Ok(socket.into())
}
