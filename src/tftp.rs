use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Block size used by RFC 1350 when no other size is configured.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Size of the opcode plus block number (or error code) fields.
pub const HEADER_SIZE: usize = 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
///
/// The mode is only carried on the wire. Payloads are always moved byte for byte, so netascii
/// requests get no line-ending translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode { NetAscii, Octet, Mail }

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }

    /// Mode names are matched case-insensitively.
    pub fn parse(raw: &str) -> Option<FileMode> {
        match raw.to_lowercase().as_str() {
            "netascii" => Some(FileMode::NetAscii),
            "octet" => Some(FileMode::Octet),
            "mail" => Some(FileMode::Mail),
            _ => None,
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    /// Maps a wire value to a code. Values outside 0-7 have no meaning in RFC 1350.
    pub fn from_u16(raw: u16) -> Option<ErrorCode> {
        match raw {
            0 => Some(ErrorCode::Undefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::Illegal),
            5 => Some(ErrorCode::UnknownTid),
            6 => Some(ErrorCode::FileAlreadyExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// The message RFC 1350 associates with this code.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::Illegal => "Illegal TFTP operation.",
            ErrorCode::UnknownTid => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => ErrorCode::DiskFull,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until it
/// finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

/// Utility function for obtaining the TFTP OpCode from a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse(
            "Request does not contain a mode, but it needs to!".to_string(),
        ));
    }

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(SocketError::PacketParse(
            "Mode must be terminated with a null byte!".to_string(),
        ));
    }

    let mode = FileMode::parse(&raw_mode)
        .ok_or_else(|| SocketError::PacketParse(format!("Unknown file mode: '{raw_mode}'")))?;

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != HEADER_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Ack packet must be 4 bytes long, got {}",
            buf.len()
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let raw_err = u16_from_buffer(&buf[2..4]);
    let (message, _) = string_from_buffer(&buf[4..]);

    let packet = match ErrorCode::from_u16(raw_err) {
        Some(code) => Packet::Error { code, message },
        // Keep the unknown value visible rather than dropping it.
        None => Packet::Error {
            code: ErrorCode::Undefined,
            message: format!("(error code {raw_err}) {message}").trim_end().to_string(),
        },
    };
    Ok(packet)
}

fn push_str_with_nul(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < HEADER_SIZE {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Serializes the packet into its big-endian wire representation.
    ///
    /// Strings are written as-is followed by a 0 byte; callers are responsible for making sure
    /// they contain no interior 0 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.op_code().as_u16().to_be_bytes());

        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                push_str_with_nul(&mut buf, path);
                push_str_with_nul(&mut buf, mode.as_str());
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                push_str_with_nul(&mut buf, message);
            }
        }

        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that sends TFTP packets and hands back
/// datagrams together with the address they came from.
pub struct TftpSocket {
    sock: Async<UdpSocket>,

    /// Largest datagram accepted on receive. One byte larger than the biggest legal DATA packet
    /// so an oversized packet can be told apart from a full block.
    recv_buf_size: usize,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr, block_size: usize) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            recv_buf_size: block_size + HEADER_SIZE + 1,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let bytes = packet.to_bytes();
        self.sock.send_to(&bytes, dst).await?;
        Ok(())
    }

    /// Waits at most `ttl` for a single datagram. Parsing is left to the caller so that the
    /// sender can be checked before the contents are trusted.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0; self.recv_buf_size];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        buf.truncate(total_written);
        Ok((buf, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F,
            0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: mail
            0x6D, 0x61, 0x69, 0x6C, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: FileMode::Mail }
        );
    }

    #[test]
    fn test_packet_write_req_mode_is_case_insensitive() {
        let mut buf = vec![0x00, 0x02];
        buf.extend_from_slice(b"boot.img\0OcTeT\0");

        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::WriteReq { path: "boot.img".to_string(), mode: FileMode::Octet }
        );
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] }
        );
    }

    #[test]
    fn test_packet_parses_empty_data() {
        assert_eq!(
            Packet::parse_from_buf(&[0x00, 0x03, 0x00, 0x07]).unwrap(),
            Packet::Data { block: 7, data: vec![] }
        );
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f } );
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal!
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Error { code: ErrorCode::Illegal, message: "Illegal!".to_string() }
        );
    }

    #[test]
    fn test_packet_parses_error_with_unknown_code() {
        let mut buf = vec![0x00, 0x05, 0x00, 0x2A];
        buf.extend_from_slice(b"odd\0");

        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::Error { code: ErrorCode::Undefined, message: "(error code 42) odd".to_string() }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        // Invalid opcodes
        assert!(Packet::parse_from_buf(&[0x10]).is_err());
        assert!(Packet::parse_from_buf(&[0x10, 0x00]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x09, 0x00, 0x00]).is_err());
        // Invalid read path
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Unterminated mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x6D, 0x61, 0x69, 0x6C])
            .is_err());
        // Invalid mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00])
            .is_err());
        // Ack with trailing garbage
        assert!(Packet::parse_from_buf(&[0x00, 0x04, 0x00, 0x01, 0xFF]).is_err());
    }

    #[test]
    fn test_request_encoding_has_two_terminators() {
        let requests = [
            ("a", FileMode::Octet),
            ("dir/file.bin", FileMode::NetAscii),
            ("x y.txt", FileMode::Mail),
        ];
        for (path, mode) in requests {
            for packet in [
                Packet::ReadReq { path: path.to_string(), mode },
                Packet::WriteReq { path: path.to_string(), mode },
            ] {
                let bytes = packet.to_bytes();
                let nuls = bytes.iter().filter(|&&b| b == 0x00).count();
                assert_eq!(nuls, 3, "opcode high byte plus two terminators");
                assert_eq!(&bytes[2..2 + path.len()], path.as_bytes());
                assert_eq!(bytes[2 + path.len()], 0x00);
                assert_eq!(&bytes[3 + path.len()..bytes.len() - 1], mode.as_str().as_bytes());
                assert_eq!(*bytes.last().unwrap(), 0x00);
                assert_eq!(Packet::parse_from_buf(&bytes).unwrap(), packet);
            }
        }
    }

    #[test]
    fn test_encode_read_req_bytes() {
        let packet = Packet::ReadReq { path: "f".to_string(), mode: FileMode::Octet };
        assert_eq!(packet.to_bytes(), b"\x00\x01f\x00octet\x00".to_vec());
    }

    #[test]
    fn test_encode_data_ack_error() {
        assert_eq!(
            Packet::Data { block: 0x0102, data: vec![0xAA, 0xBB] }.to_bytes(),
            vec![0x00, 0x03, 0x01, 0x02, 0xAA, 0xBB]
        );
        assert_eq!(Packet::Ack { block: 0xFFFF }.to_bytes(), vec![0x00, 0x04, 0xFF, 0xFF]);
        assert_eq!(
            Packet::Error { code: ErrorCode::UnknownTid, message: "no".to_string() }.to_bytes(),
            vec![0x00, 0x05, 0x00, 0x05, b'n', b'o', 0x00]
        );
    }

    #[test]
    fn test_error_code_table() {
        for raw in 0..8 {
            let code = ErrorCode::from_u16(raw).unwrap();
            assert_eq!(code.as_u16(), raw);
        }
        assert_eq!(ErrorCode::from_u16(8), None);
        assert_eq!(ErrorCode::FileNotFound.description(), "File not found.");
        assert_eq!(ErrorCode::NoSuchUser.description(), "No such user.");
    }

    #[test]
    fn test_error_code_from_io_kind() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::PermissionDenied), ErrorCode::AccessViolation);
        assert_eq!(ErrorCode::from(io::ErrorKind::AlreadyExists), ErrorCode::FileAlreadyExists);
        assert_eq!(ErrorCode::from(io::ErrorKind::Interrupted), ErrorCode::Undefined);
    }

    #[tokio::test]
    async fn test_socket_recv_times_out() {
        let sock = TftpSocket::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_BLOCK_SIZE).unwrap();
        let res = sock.recv_with_timeout(Duration::from_millis(50)).await;
        assert!(matches!(res, Err(SocketError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_socket_send_and_recv() {
        let a = TftpSocket::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_BLOCK_SIZE).unwrap();
        let b = TftpSocket::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_BLOCK_SIZE).unwrap();

        a.send(&Packet::Ack { block: 9 }, b.local_addr().unwrap()).await.unwrap();
        let (buf, src) = b.recv_with_timeout(Duration::from_secs(2)).await.unwrap();

        assert_eq!(src, a.local_addr().unwrap());
        assert_eq!(Packet::parse_from_buf(&buf).unwrap(), Packet::Ack { block: 9 });
    }
}
