// A TFTP client compliant with RFC 1350.
//
// A transfer starts with a read request (RRQ) or write request (WRQ) sent to the server's
// well-known port, 69 by default. The server answers from a port of its own choosing, and that
// port pair is the transfer ID for the rest of the session.
//
// Files move in fixed-size blocks, 512 bytes unless configured otherwise. Each DATA packet
// carries one block and must be acknowledged before the next one is sent. A DATA packet shorter
// than a full block ends the transfer, so a file whose length is an exact multiple of the block
// size ends with an empty block.
//
// Packets (big-endian):
//
// opcode   operation   layout
// 1        RRQ         0x01 | filename | 0x00 | mode | 0x00
// 2        WRQ         0x02 | filename | 0x00 | mode | 0x00
// 3        DATA        0x03 | block (2 bytes) | data (0 to block size bytes)
// 4        ACK         0x04 | block (2 bytes)
// 5        ERROR       0x05 | error code (2 bytes) | message | 0x00
//
// An ERROR ends the transfer and is never acknowledged or retransmitted. Lost packets are
// recovered by timing out and resending the last packet, a bounded number of times.

pub mod client_conn;
pub mod config;
pub mod processor;
pub mod tftp;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};

use client_conn::{TransferHandler, TransferRequest};
use config::{ClientConfig, Direction};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Operation {
    /// Download a file from the server.
    Get,
    /// Upload a file to the server.
    Put,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Put => "put",
        }
    }
}

impl From<Operation> for Direction {
    fn from(op: Operation) -> Direction {
        match op {
            Operation::Get => Direction::Get,
            Operation::Put => Direction::Put,
        }
    }
}

/// Moves a single file to or from a TFTP server.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Server host name or IP address.
    host: String,

    #[arg(value_enum, ignore_case = true)]
    operation: Operation,

    /// Name of the file on the server.
    filename: String,

    /// Server port for the initial request.
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Local file to write to (get) or read from (put). Defaults to the remote filename.
    #[arg(short, long)]
    local: Option<PathBuf>,

    /// Transfer mode sent to the server: octet, netascii or mail. Data is never translated.
    #[arg(short, long, default_value = "octet", value_parser = parse_mode)]
    mode: tftp::FileMode,

    /// Block size. Must match what the server uses; it is not negotiated.
    #[arg(short, long, default_value_t = tftp::DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Seconds to wait for each reply before retransmitting.
    #[arg(short, long, default_value_t = config::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Retransmissions allowed before giving up (default 3 for get, 5 for put).
    #[arg(short, long)]
    retries: Option<u32>,
}

fn parse_mode(raw: &str) -> std::result::Result<tftp::FileMode, String> {
    tftp::FileMode::parse(raw).ok_or_else(|| format!("unknown transfer mode '{raw}'"))
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        let config = ClientConfig {
            port: self.port,
            block_size: self.block_size,
            timeout: Duration::from_secs(self.timeout),
            mode: self.mode,
            ..Default::default()
        };
        match self.retries {
            Some(retries) => config.with_retries(retries),
            None => config,
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {host}"))?
        .next()
        .ok_or_else(|| anyhow!("No addresses found for {host}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.client_config();
    config.validate()?;

    let server = resolve(&cli.host, config.port).await?;
    let local_path = cli.local.clone().unwrap_or_else(|| PathBuf::from(&cli.filename));
    let request = TransferRequest::new(&cli.filename, config.mode, cli.operation.into())?;

    let handler = TransferHandler::new(&config, request, server, &local_path)
        .await
        .with_context(|| {
            format!("Failed to start {} of '{}'", cli.operation.as_str(), cli.filename)
        })?;

    match handler.run().await {
        Ok(summary) => {
            println!(
                "{} '{}': {} bytes in {} blocks ({})",
                summary.direction, cli.filename, summary.bytes, summary.blocks, summary.peer
            );
            Ok(())
        }
        Err(e) => {
            log::error!("{e}");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["tftp-client", "10.0.0.1", "get", "boot.img"]).unwrap();
        assert_eq!(cli.client_config(), ClientConfig::default());
        assert!(matches!(cli.operation, Operation::Get));
        assert_eq!(cli.local, None);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "tftp-client", "server", "PUT", "fw.bin", "-p", "6969", "-l", "/tmp/fw.bin", "-m",
            "NetAscii", "-b", "1024", "-t", "2", "-r", "7",
        ])
        .unwrap();
        let config = cli.client_config();

        assert!(matches!(cli.operation, Operation::Put));
        assert_eq!(cli.local, Some(PathBuf::from("/tmp/fw.bin")));
        assert_eq!(config.port, 6969);
        assert_eq!(config.mode, tftp::FileMode::NetAscii);
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.max_retries(Direction::Get), 7);
        assert_eq!(config.max_retries(Direction::Put), 7);
    }

    #[test]
    fn test_cli_rejects_unknown_operation_and_mode() {
        assert!(Cli::try_parse_from(["tftp-client", "h", "delete", "f"]).is_err());
        assert!(Cli::try_parse_from(["tftp-client", "h", "get", "f", "-m", "binary"]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1", 69).await.unwrap();
        assert_eq!(addr, "127.0.0.1:69".parse().unwrap());
    }
}
