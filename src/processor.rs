use crate::tftp;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Drives one direction of a transfer. The processor owns the local file and the block counter;
/// the connection handler owns the socket and decides what to do with each `ResultAction`.
#[derive(Debug)]
pub enum TransferProcessor {
    Download(DownloadProcessor),
    Upload(UploadProcessor),
}

impl TransferProcessor {
    /// Prepares to receive a remote file into `path`. Blocks are written to a sibling `.part`
    /// file which only replaces `path` once the last block has arrived, so an existing file at
    /// `path` is left alone if the transfer fails.
    pub async fn new_for_download(
        path: &Path,
        block_size: usize,
    ) -> Result<TransferProcessor, io::Error> {
        let part_path = part_path_for(path);
        log::info!("Writing to {}", part_path.display());
        let f = File::create(&part_path).await?;
        Ok(TransferProcessor::Download(DownloadProcessor::new(f, path, part_path, block_size)))
    }

    /// Opens `path` to be sent to the server.
    pub async fn new_for_upload(
        path: &Path,
        block_size: usize,
    ) -> Result<TransferProcessor, io::Error> {
        log::info!("Reading from {}", path.display());
        let f = File::open(path).await?;
        Ok(TransferProcessor::Upload(UploadProcessor::new(f, block_size)))
    }

    /// Given an incoming packet from the peer, processes it and describes the action the caller
    /// should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            TransferProcessor::Download(p) => p.process_data(packet).await,
            TransferProcessor::Upload(p) => p.process_ack(packet).await,
        }
    }

    /// Number of blocks and payload bytes accepted so far.
    pub fn transferred(&self) -> (u64, u64) {
        match self {
            TransferProcessor::Download(p) => (p.blocks, p.bytes),
            TransferProcessor::Upload(p) => (p.blocks, p.bytes),
        }
    }

    /// Releases the local file after a failed transfer. A partial download is removed so that no
    /// truncated output is left behind.
    pub async fn discard(self) {
        match self {
            TransferProcessor::Download(p) => p.discard().await,
            TransferProcessor::Upload(_) => {}
        }
    }
}

/// `<path>.part`, next to `path` so the final rename stays on one filesystem.
fn part_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Represents an action that the caller of TransferProcessor should take in
/// response to processing a packet.
#[derive(Debug)]
pub enum ResultAction {
    /// The peer made progress. Caller should send the packet, reset its retry counter and await
    /// a response.
    SendPacketAndAwait(tftp::Packet),

    /// The packet was an anomaly. Caller should resend the last packet it sent.
    Retransmit,

    /// The packet was an anomaly that must not be answered. Caller should keep waiting.
    RetryRecv,

    /// The transfer finished. Caller should send the packet, if any, and close the connection.
    Complete(Option<tftp::Packet>),

    /// The peer aborted the transfer with an error packet.
    RemoteError { code: tftp::ErrorCode, message: String },

    /// Reading or writing the local file failed.
    LocalError(io::Error),
}

impl PartialEq for ResultAction {
    fn eq(&self, other: &Self) -> bool {
        use ResultAction::*;
        match (self, other) {
            (SendPacketAndAwait(a), SendPacketAndAwait(b)) => a == b,
            (Retransmit, Retransmit) | (RetryRecv, RetryRecv) => true,
            (Complete(a), Complete(b)) => a == b,
            (
                RemoteError { code: c1, message: m1 },
                RemoteError { code: c2, message: m2 },
            ) => c1 == c2 && m1 == m2,
            (LocalError(a), LocalError(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct DownloadProcessor {
    f: File,
    /// Where the finished file ends up.
    path: PathBuf,
    /// Where blocks are written until the transfer completes.
    part_path: PathBuf,
    block_size: usize,
    expected_block: u16,
    blocks: u64,
    bytes: u64,
}

impl DownloadProcessor {
    fn new(f: File, path: &Path, part_path: PathBuf, block_size: usize) -> DownloadProcessor {
        DownloadProcessor {
            f,
            path: path.to_path_buf(),
            part_path,
            block_size,
            expected_block: 1,
            blocks: 0,
            bytes: 0,
        }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } if *block == self.expected_block => {
                if data.len() > self.block_size {
                    log::warn!(
                        "Block {block} carries {} bytes, more than the block size of {}",
                        data.len(),
                        self.block_size
                    );
                    return ResultAction::RetryRecv;
                }

                if let Err(e) = self.f.write_all(data).await {
                    return ResultAction::LocalError(e);
                }

                self.blocks += 1;
                self.bytes += data.len() as u64;
                self.expected_block = self.expected_block.wrapping_add(1);
                log::debug!("Received block {block} ({} bytes)", data.len());

                let ack = tftp::Packet::Ack { block: *block };
                if data.len() < self.block_size {
                    if let Err(e) = self.finish().await {
                        return ResultAction::LocalError(e);
                    }
                    ResultAction::Complete(Some(ack))
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            tftp::Packet::Data { block, .. } => {
                // Acknowledging anything but the expected block could desynchronize the server,
                // so unexpected blocks are dropped without an answer.
                log::warn!("Ignoring block {block}, expected block {}", self.expected_block);
                ResultAction::RetryRecv
            }
            tftp::Packet::Error { code, message } => ResultAction::RemoteError {
                code: *code,
                message: message.clone(),
            },
            _ => {
                log::warn!(
                    "Expected to receive a Data packet, but got {:?} instead",
                    packet.op_code()
                );
                ResultAction::RetryRecv
            }
        }
    }

    /// Moves the completed `.part` file over the destination.
    async fn finish(&mut self) -> Result<(), io::Error> {
        self.f.flush().await?;
        self.f.sync_all().await?;
        tokio::fs::rename(&self.part_path, &self.path).await?;
        log::debug!("Moved {} to {}", self.part_path.display(), self.path.display());
        Ok(())
    }

    async fn discard(self) {
        drop(self.f);
        match tokio::fs::remove_file(&self.part_path).await {
            Ok(()) => log::info!("Removed partial download {}", self.part_path.display()),
            // Already renamed into place, or never written.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "Could not remove partial download {}: {e}",
                self.part_path.display()
            ),
        }
    }
}

#[derive(Debug)]
pub struct UploadProcessor {
    f: File,
    block_size: usize,
    curr_block: u16,
    final_block_sent: bool,
    blocks: u64,
    bytes: u64,
}

impl UploadProcessor {
    fn new(f: File, block_size: usize) -> UploadProcessor {
        UploadProcessor {
            f,
            block_size,
            // The server acknowledges the write request itself with block 0.
            curr_block: 0,
            final_block_sent: false,
            blocks: 0,
            bytes: 0,
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                if self.final_block_sent {
                    log::debug!("Final block {block} acknowledged");
                    return ResultAction::Complete(None);
                }

                match read_block_from_file(&mut self.f, self.block_size).await {
                    Ok(data) => {
                        self.curr_block = self.curr_block.wrapping_add(1);
                        if data.len() < self.block_size {
                            self.final_block_sent = true;
                        }
                        self.blocks += 1;
                        self.bytes += data.len() as u64;
                        log::debug!("Sending block {} ({} bytes)", self.curr_block, data.len());
                        ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                            block: self.curr_block,
                            data,
                        })
                    }
                    Err(e) => ResultAction::LocalError(e),
                }
            }
            tftp::Packet::Ack { block } => {
                log::warn!("Got ack for block {block}, expected {}", self.curr_block);
                ResultAction::Retransmit
            }
            tftp::Packet::Error { code, message } => ResultAction::RemoteError {
                code: *code,
                message: message.clone(),
            },
            _ => {
                log::warn!(
                    "Expected to receive an Ack packet, but got {:?} instead",
                    packet.op_code()
                );
                ResultAction::Retransmit
            }
        }
    }
}

async fn read_block_from_file(f: &mut File, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without being at EOF, so keep reading
    // into the rest of the buffer until it is full or the file runs out.
    loop {
        let s = f.read(&mut buf[cursor..]).await?;
        cursor += s;
        if cursor == buf.len() {
            return Ok(buf);
        } else if s == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}
