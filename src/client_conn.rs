// This module contains the client-side connection handler.
//
// A transfer starts when the client sends a ReadReq or a WriteReq to the server's well-known
// port. Everything after that goes through a TransferHandler, which works in roughly the
// following stages:
//
// 1. Open the local file and bind a socket on a random port, which becomes the client's TID.
// 2. Send the request. The first reply from the server comes from a fresh port chosen by the
//    server; that address is recorded once and every later packet goes to it. Packets from any
//    other address are answered with an "unknown transfer ID" error and otherwise ignored.
// 3. Alternate between waiting for a reply and sending the packet the processor asks for. Only
//    one packet is ever outstanding. A timeout resends the last packet, and so do anomalies on
//    uploads. Timeouts and anomalies draw from the same retry budget, which is refilled whenever
//    the transfer makes progress.
// 4. Stop in exactly one of two states: done, or failed. A failed download removes its partial
//    output and leaves whatever was already at the destination path untouched.

use crate::config::{ClientConfig, ConfigError, Direction};
use crate::processor::{ResultAction, TransferProcessor};
use crate::tftp;
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::io;
use tokio::time::Instant;

/// Number of random ports tried before letting the OS pick one.
const BIND_ATTEMPTS: usize = 16;

/// A request to move one file to or from the server. Immutable once sent.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    filename: String,
    mode: tftp::FileMode,
    direction: Direction,
}

impl TransferRequest {
    pub fn new(
        filename: &str,
        mode: tftp::FileMode,
        direction: Direction,
    ) -> Result<TransferRequest, TransferError> {
        if filename.is_empty() {
            return Err(TransferError::InvalidRequest("Filename must not be empty".to_string()));
        }
        if filename.contains('\0') {
            return Err(TransferError::InvalidRequest(format!(
                "Filename {filename:?} contains a NUL byte"
            )));
        }
        Ok(TransferRequest { filename: filename.to_string(), mode, direction })
    }

    pub fn to_packet(&self) -> tftp::Packet {
        let path = self.filename.clone();
        match self.direction {
            Direction::Get => tftp::Packet::ReadReq { path, mode: self.mode },
            Direction::Put => tftp::Packet::WriteReq { path, mode: self.mode },
        }
    }
}

/// Sends the request that opens a transfer. No reply is awaited here.
pub async fn initiate(
    sock: &tftp::TftpSocket,
    request: &TransferRequest,
    server: SocketAddr,
) -> Result<(), TransferError> {
    log::info!("Requesting {} of '{}' from {}", request.direction, request.filename, server);
    sock.send(&request.to_packet(), server).await?;
    Ok(())
}

/// Whether a datagram's sender belongs to this transfer.
#[derive(Debug, PartialEq)]
enum Source {
    /// First reply from the server; its address is now the peer.
    Bound,
    Peer,
    Stray,
}

/// Mutable bookkeeping for one transfer that isn't tied to a direction.
#[derive(Debug)]
pub struct TransferState {
    pub direction: Direction,

    /// Address the request was sent to.
    server: SocketAddr,

    /// Address confirmed by the server's first reply. Set once, never changed.
    peer: Option<SocketAddr>,

    pub retries: u32,
    pub max_retries: u32,
    pub block_size: usize,
}

impl TransferState {
    pub fn new(
        direction: Direction,
        server: SocketAddr,
        max_retries: u32,
        block_size: usize,
    ) -> TransferState {
        TransferState { direction, server, peer: None, retries: 0, max_retries, block_size }
    }

    fn destination(&self) -> SocketAddr {
        self.peer.unwrap_or(self.server)
    }

    fn check_source(&mut self, src: SocketAddr) -> Source {
        match self.peer {
            Some(peer) if peer == src => Source::Peer,
            Some(_) => Source::Stray,
            // The server answers from a new port, but it should still be the same host.
            None if src.ip() == self.server.ip() => {
                self.peer = Some(src);
                Source::Bound
            }
            None => Source::Stray,
        }
    }

    fn record_retry(&mut self) -> Result<(), TransferError> {
        self.retries += 1;
        if self.retries > self.max_retries {
            return Err(TransferError::MaxRetriesExceeded(self.max_retries));
        }
        Ok(())
    }

    fn reset_retries(&mut self) {
        self.retries = 0;
    }
}

/// What a completed transfer moved.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub direction: Direction,
    pub peer: SocketAddr,
    pub blocks: u64,
    pub bytes: u64,
}

/// Outcome of waiting for a reply.
enum Reply {
    Send(tftp::Packet),
    Retransmit,
    Finish(Option<tftp::Packet>),
}

/// Binds a socket on a random high port, falling back to an OS-assigned one.
fn bind_random_socket(
    server: SocketAddr,
    block_size: usize,
) -> tftp::TftpResult<tftp::TftpSocket> {
    let ip: IpAddr = if server.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let mut rng = rand::thread_rng();
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(1024..65535);
        match tftp::TftpSocket::bind(SocketAddr::new(ip, port), block_size) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("Couldn't bind port {port}: {e}"),
        }
    }
    tftp::TftpSocket::bind(SocketAddr::new(ip, 0), block_size)
}

async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

/// An object responsible for running a single transfer.
pub struct TransferHandler {
    /// The TFTP socket used to send and receive packets.
    sock: tftp::TftpSocket,

    request: TransferRequest,

    state: TransferState,

    /// The packet processor.
    processor: TransferProcessor,

    /// How long to wait for each reply.
    timeout: Duration,
}

impl TransferHandler {
    pub async fn new(
        config: &ClientConfig,
        request: TransferRequest,
        server: SocketAddr,
        local_path: &Path,
    ) -> Result<TransferHandler, TransferError> {
        config.validate()?;

        let sock = bind_random_socket(server, config.block_size)?;
        log::debug!("Bound {}", sock.local_addr()?);

        let processor = match request.direction {
            Direction::Get => {
                TransferProcessor::new_for_download(local_path, config.block_size).await
            }
            Direction::Put => {
                TransferProcessor::new_for_upload(local_path, config.block_size).await
            }
        }
        .map_err(TransferError::LocalIo)?;

        let state = TransferState::new(
            request.direction,
            server,
            config.max_retries(request.direction),
            config.block_size,
        );

        Ok(TransferHandler { sock, request, state, processor, timeout: config.timeout })
    }

    /// Runs the transfer to completion. The socket and the local file are released on every path
    /// out of here.
    pub async fn run(mut self) -> Result<TransferSummary, TransferError> {
        match self.exchange().await {
            Ok(()) => {
                let (blocks, bytes) = self.processor.transferred();
                let peer = self.state.destination();
                log::info!(
                    "Transfer of '{}' complete: {bytes} bytes in {blocks} blocks",
                    self.request.filename
                );
                Ok(TransferSummary { direction: self.state.direction, peer, blocks, bytes })
            }
            Err(e) => {
                log::debug!("Transfer of '{}' failed: {e}", self.request.filename);
                self.processor.discard().await;
                Err(e)
            }
        }
    }

    async fn exchange(&mut self) -> Result<(), TransferError> {
        log::debug!(
            "Block size {}, timeout {:?}, up to {} retries",
            self.state.block_size,
            self.timeout,
            self.state.max_retries
        );
        initiate(&self.sock, &self.request, self.state.server).await?;
        let mut last_sent = self.request.to_packet();

        loop {
            match self.await_reply().await? {
                Reply::Send(packet) => {
                    self.state.reset_retries();
                    self.sock.send(&packet, self.state.destination()).await?;
                    last_sent = packet;
                }
                Reply::Retransmit => {
                    log::warn!(
                        "Resending {:?} to {} ({}/{})",
                        last_sent.op_code(),
                        self.state.destination(),
                        self.state.retries,
                        self.state.max_retries
                    );
                    self.sock.send(&last_sent, self.state.destination()).await?;
                }
                Reply::Finish(packet) => {
                    if let Some(p) = packet {
                        self.sock.send(&p, self.state.destination()).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Waits for one meaningful reply from the peer, dealing with stray and unanswerable packets
    /// along the way. Returns an error once the transfer cannot continue.
    ///
    /// Packets that are dropped without an answer (unexpected blocks, malformed datagrams) cost
    /// at most one retry per wait, however many of them arrive. A server that retransmits faster
    /// than our timeout would otherwise drain the budget before our own resend gets a chance.
    async fn await_reply(&mut self) -> Result<Reply, TransferError> {
        let deadline = Instant::now() + self.timeout;
        let mut anomaly_charged = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (buf, src) = match self.sock.recv_with_timeout(remaining).await {
                Ok(received) => received,
                Err(tftp::SocketError::Timeout(_)) => {
                    log::warn!(
                        "Timed out waiting for a reply from {}",
                        self.state.destination()
                    );
                    self.state.record_retry()?;
                    return Ok(Reply::Retransmit);
                }
                Err(e) => return Err(e.into()),
            };

            match self.state.check_source(src) {
                Source::Bound => log::info!("Server is answering from {src}"),
                Source::Peer => {}
                Source::Stray => {
                    log::warn!("Dropping packet from unknown sender {src}");
                    send_error_packet(
                        &self.sock,
                        src,
                        tftp::ErrorCode::UnknownTid,
                        tftp::ErrorCode::UnknownTid.description().to_string(),
                    )
                    .await;
                    continue;
                }
            }

            let action = match tftp::Packet::parse_from_buf(&buf) {
                Ok(packet) => self.processor.process_packet(&packet).await,
                Err(e) => {
                    log::warn!("Dropping malformed packet from {src}: {e}");
                    ResultAction::RetryRecv
                }
            };

            match action {
                ResultAction::SendPacketAndAwait(p) => return Ok(Reply::Send(p)),
                ResultAction::Complete(p) => return Ok(Reply::Finish(p)),
                ResultAction::Retransmit => {
                    self.state.record_retry()?;
                    return Ok(Reply::Retransmit);
                }
                ResultAction::RetryRecv => {
                    if !anomaly_charged {
                        self.state.record_retry()?;
                        anomaly_charged = true;
                    }
                    continue;
                }
                ResultAction::RemoteError { code, message } => {
                    return Err(TransferError::Protocol { code, message });
                }
                ResultAction::LocalError(e) => {
                    send_error_packet(&self.sock, src, e.kind().into(), e.to_string()).await;
                    return Err(TransferError::LocalIo(e));
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum TransferError {
    InvalidRequest(String),
    Config(ConfigError),
    /// The server sent an error packet.
    Protocol { code: tftp::ErrorCode, message: String },
    MaxRetriesExceeded(u32),
    LocalIo(io::Error),
    Socket(tftp::SocketError),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Config(e) => write!(f, "Invalid configuration: {}", e),
            Self::Protocol { code, message } if message.is_empty() => {
                write!(f, "Error from server ({}): {}", code.as_u16(), code.description())
            }
            Self::Protocol { code, message } => {
                write!(f, "Error from server ({}): {}", code.as_u16(), message)
            }
            Self::MaxRetriesExceeded(max) => {
                write!(f, "Max retries exceeded ({max}), aborting transfer")
            }
            Self::LocalIo(e) => write!(f, "Local file error: {}", e),
            Self::Socket(e) => write!(f, "{}", e),
        }
    }
}

impl From<tftp::SocketError> for TransferError {
    fn from(e: tftp::SocketError) -> TransferError {
        TransferError::Socket(e)
    }
}

impl From<ConfigError> for TransferError {
    fn from(e: ConfigError) -> TransferError {
        TransferError::Config(e)
    }
}
