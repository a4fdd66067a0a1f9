use crate::tftp::{FileMode, DEFAULT_BLOCK_SIZE};
use std::error;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 69;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_GET_RETRIES: u32 = 3;
pub const DEFAULT_PUT_RETRIES: u32 = 5;

/// Bounds RFC 2348 places on a block size. The size is never negotiated here, so anything other
/// than 512 only works against a server configured the same way.
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction { Get, Put }

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Get => f.write_str("get"),
            Direction::Put => f.write_str("put"),
        }
    }
}

/// Settings shared by every transfer the client runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Port the initial request is sent to.
    pub port: u16,
    pub block_size: usize,
    /// How long to wait for each reply before retransmitting.
    pub timeout: Duration,
    pub get_retries: u32,
    pub put_retries: u32,
    pub mode: FileMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            port: DEFAULT_PORT,
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            get_retries: DEFAULT_GET_RETRIES,
            put_retries: DEFAULT_PUT_RETRIES,
            mode: FileMode::Octet,
        }
    }
}

impl ClientConfig {
    /// Sets the same retry budget for both directions.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.get_retries = retries;
        self.put_retries = retries;
        self
    }

    pub fn max_retries(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Get => self.get_retries,
            Direction::Put => self.put_retries,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Timeout);
        }
        if self.port == 0 {
            return Err(ConfigError::Port);
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    BlockSize(usize),
    Timeout,
    Port,
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BlockSize(size) => write!(
                f,
                "Block size {size} is out of range, must be between {} and {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            ),
            Self::Timeout => write!(f, "Timeout must be greater than zero"),
            Self::Port => write!(f, "Port 0 cannot be used as a server port"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 69);
        assert_eq!(config.block_size, 512);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries(Direction::Get), 3);
        assert_eq!(config.max_retries(Direction::Put), 5);
        assert_eq!(config.mode, FileMode::Octet);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_with_retries_overrides_both_directions() {
        let config = ClientConfig::default().with_retries(9);
        assert_eq!(config.max_retries(Direction::Get), 9);
        assert_eq!(config.max_retries(Direction::Put), 9);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ClientConfig { block_size: 4, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::BlockSize(4)));

        let config = ClientConfig { block_size: 65465, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::BlockSize(65465)));

        let config = ClientConfig { timeout: Duration::ZERO, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::Timeout));

        let config = ClientConfig { port: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::Port));
    }
}
