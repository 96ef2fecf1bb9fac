//! Socket loops for every ingestion protocol
//!
//! UDP listeners hand each datagram to a shared engine. TCP listeners
//! accept connections and spawn one task per socket; each task
//! accumulates bytes, drains complete frames through the connection's
//! engine and writes back whatever the engine answers. All loops stop
//! when the shared cancellation token fires.

use bytes::{Buf, BytesMut};
use fleetgate_codec::FrameOutcome;
use fleetgate_codec::{concox, satellite, wialon};
use fleetgate_core::config::ListenerConfig;
use fleetgate_engine::engine::EngineCore;
use fleetgate_engine::{
    AvlEngine, ConcoxConnection, EngineOutcome, MeiligaoEngine, SatelliteConnection, SessionStore,
    WialonConnection,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Initial read-buffer capacity; also bounds a single UDP datagram
const READ_BUFFER_SIZE: usize = 2048;

/// Read-loop timing for the TCP listeners
#[derive(Debug, Clone, Copy)]
pub struct TcpOptions {
    /// How long a single read waits before the idle clock ticks
    pub read_tick: Duration,
    /// Accumulated silence after which the connection is dropped
    pub idle_timeout: Duration,
}

impl TcpOptions {
    /// Build from the listener section of the configuration.
    #[must_use]
    pub const fn from_config(config: &ListenerConfig) -> Self {
        Self {
            read_tick: Duration::from_secs(config.read_tick_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

/// Receive loop for the AVL UDP ports.
pub async fn run_avl_udp(socket: UdpSocket, engine: Arc<AvlEngine>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "AVL receive failed");
                        continue;
                    }
                };
                let endpoint = peer.to_string();
                if let EngineOutcome::Respond(bytes) =
                    engine.handle_datagram(&buf[..len], &endpoint).await
                {
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        warn!(peer = %endpoint, error = %e, "AVL send failed");
                    }
                }
            }
        }
    }
    info!("AVL UDP listener stopped");
}

/// Receive loop for the Meiligao UDP port. The protocol is one-way on
/// our side, so nothing is ever written back.
pub async fn run_meiligao_udp(
    socket: UdpSocket,
    engine: Arc<MeiligaoEngine>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Meiligao receive failed");
                        continue;
                    }
                };
                engine.handle_datagram(&buf[..len], &peer.to_string()).await;
            }
        }
    }
    info!("Meiligao UDP listener stopped");
}

/// Accept loop for the Concox TCP port.
pub async fn run_concox_tcp(
    listener: TcpListener,
    core: EngineCore,
    options: TcpOptions,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Some((stream, endpoint)) = check_accept(accepted, "concox") else {
                    continue;
                };
                let core = core.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_concox(stream, core, &endpoint, options, token).await {
                        debug!(peer = %endpoint, error = %e, "Concox connection error");
                    }
                });
            }
        }
    }
    info!("Concox TCP listener stopped");
}

/// Accept loop for the Wialon TCP port.
pub async fn run_wialon_tcp(
    listener: TcpListener,
    core: EngineCore,
    options: TcpOptions,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Some((stream, endpoint)) = check_accept(accepted, "wialon") else {
                    continue;
                };
                let core = core.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_wialon(stream, core, &endpoint, options, token).await {
                        debug!(peer = %endpoint, error = %e, "Wialon connection error");
                    }
                });
            }
        }
    }
    info!("Wialon TCP listener stopped");
}

/// Accept loop for the satellite modem TCP port.
pub async fn run_satellite_tcp(
    listener: TcpListener,
    core: EngineCore,
    options: TcpOptions,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Some((stream, endpoint)) = check_accept(accepted, "satellite") else {
                    continue;
                };
                let core = core.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_satellite(stream, core, &endpoint, options, token).await {
                        debug!(peer = %endpoint, error = %e, "satellite connection error");
                    }
                });
            }
        }
    }
    info!("satellite TCP listener stopped");
}

/// Periodically expire idle sessions.
pub async fn run_session_sweeper(
    sessions: Arc<SessionStore>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    // the first tick fires immediately; skip it
    tick.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = tick.tick() => {
                match sessions.sweep().await {
                    Ok(0) => {}
                    Ok(expired) => debug!(expired, "expired idle sessions"),
                    Err(e) => warn!(error = %e, "session sweep failed"),
                }
            }
        }
    }
}

fn check_accept(
    accepted: io::Result<(TcpStream, std::net::SocketAddr)>,
    protocol: &'static str,
) -> Option<(TcpStream, String)> {
    match accepted {
        Ok((stream, peer)) => {
            metrics::counter!("fleetgate_connections_total", "protocol" => protocol).increment(1);
            Some((stream, peer.to_string()))
        }
        Err(e) => {
            warn!(protocol, error = %e, "accept failed");
            None
        }
    }
}

/// What one pass of the read half produced.
enum ReadStep {
    Data,
    Idle,
    Eof,
    Cancelled,
}

/// Read once into `buf`, tracking accumulated silence in `idle`.
async fn read_step(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    idle: &mut Duration,
    options: TcpOptions,
    shutdown: &CancellationToken,
) -> io::Result<ReadStep> {
    tokio::select! {
        () = shutdown.cancelled() => Ok(ReadStep::Cancelled),
        read = tokio::time::timeout(options.read_tick, stream.read_buf(buf)) => {
            match read {
                Err(_) => {
                    *idle += options.read_tick;
                    if *idle >= options.idle_timeout {
                        Ok(ReadStep::Eof)
                    } else {
                        Ok(ReadStep::Idle)
                    }
                }
                Ok(Ok(0)) => Ok(ReadStep::Eof),
                Ok(Ok(_)) => {
                    *idle = Duration::ZERO;
                    Ok(ReadStep::Data)
                }
                Ok(Err(e)) => Err(e),
            }
        }
    }
}

async fn serve_concox(
    mut stream: TcpStream,
    core: EngineCore,
    endpoint: &str,
    options: TcpOptions,
    shutdown: CancellationToken,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut conn = ConcoxConnection::new(core, endpoint.to_string());
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut idle = Duration::ZERO;

    let result = 'conn: loop {
        match read_step(&mut stream, &mut buf, &mut idle, options, &shutdown).await {
            Ok(ReadStep::Data) => {}
            Ok(ReadStep::Idle) => continue,
            Ok(ReadStep::Eof | ReadStep::Cancelled) => break Ok(()),
            Err(e) => break Err(e),
        }
        loop {
            match concox::read_frame(&buf) {
                FrameOutcome::Frame { frame, consumed } => {
                    buf.advance(consumed);
                    match conn.handle_frame(&frame).await {
                        EngineOutcome::Respond(bytes) => {
                            if let Err(e) = stream.write_all(&bytes).await {
                                break 'conn Err(e);
                            }
                        }
                        EngineOutcome::Silent => {}
                        EngineOutcome::Close => break 'conn Ok(()),
                    }
                }
                FrameOutcome::NeedMore => break,
                FrameOutcome::Invalid(e) => {
                    warn!(peer = endpoint, error = %e, "garbage on the Concox socket");
                    break 'conn Ok(());
                }
            }
        }
    };
    conn.on_disconnect().await;
    result
}

async fn serve_wialon(
    mut stream: TcpStream,
    core: EngineCore,
    endpoint: &str,
    options: TcpOptions,
    shutdown: CancellationToken,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut conn = WialonConnection::new(core, endpoint.to_string());
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut idle = Duration::ZERO;

    let result = 'conn: loop {
        match read_step(&mut stream, &mut buf, &mut idle, options, &shutdown).await {
            Ok(ReadStep::Data) => {}
            Ok(ReadStep::Idle) => continue,
            Ok(ReadStep::Eof | ReadStep::Cancelled) => break Ok(()),
            Err(e) => break Err(e),
        }
        loop {
            match wialon::read_line(&buf) {
                FrameOutcome::Frame { frame, consumed } => {
                    buf.advance(consumed);
                    match conn.handle_message(frame).await {
                        EngineOutcome::Respond(bytes) => {
                            if let Err(e) = stream.write_all(&bytes).await {
                                break 'conn Err(e);
                            }
                        }
                        EngineOutcome::Silent => {}
                        EngineOutcome::Close => break 'conn Ok(()),
                    }
                }
                FrameOutcome::NeedMore => break,
                FrameOutcome::Invalid(e) => {
                    warn!(peer = endpoint, error = %e, "garbage on the Wialon socket");
                    break 'conn Ok(());
                }
            }
        }
    };
    conn.on_disconnect().await;
    result
}

/// Satellite modems transmit one burst and hang up; the burst has no
/// framing the stream codec can align on mid-transfer, so decoding
/// happens once, after the peer closes or goes quiet.
async fn serve_satellite(
    mut stream: TcpStream,
    core: EngineCore,
    endpoint: &str,
    options: TcpOptions,
    shutdown: CancellationToken,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let conn = SatelliteConnection::new(core, endpoint.to_string());
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut idle = Duration::ZERO;

    loop {
        match read_step(&mut stream, &mut buf, &mut idle, options, &shutdown).await {
            Ok(ReadStep::Data | ReadStep::Idle) => {}
            Ok(ReadStep::Eof | ReadStep::Cancelled) => break,
            Err(e) => return Err(e),
        }
    }

    if buf.is_empty() {
        return Ok(());
    }
    match satellite::read_burst(&buf) {
        FrameOutcome::Frame { frame, .. } => {
            conn.handle_burst(&frame).await;
        }
        FrameOutcome::NeedMore => debug!(peer = endpoint, "incomplete satellite burst"),
        FrameOutcome::Invalid(e) => {
            warn!(peer = endpoint, error = %e, "undecodable satellite burst");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tcp_options_come_from_the_listener_section() {
        let config = fleetgate_core::Config::default();
        let options = TcpOptions::from_config(&config.listeners);

        assert_eq!(options.read_tick, Duration::from_secs(2));
        assert_eq!(options.idle_timeout, Duration::from_secs(360));
    }
}
