//! The ordered list of knock ports.

use super::ConfigError;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Ordered, duplicate-free list of knock ports (length >= 2).
///
/// Repeated ports are rejected: with a repeat, a knock could be read both as
/// an advance and as a fresh start, and the state machine would be ambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockSequence {
    ports: Vec<u16>,
}

impl KnockSequence {
    /// Shortest accepted sequence.
    pub const MIN_LEN: usize = 2;

    /// Validate and build a sequence.
    pub fn new(ports: Vec<u16>) -> Result<Self, ConfigError> {
        if ports.len() < Self::MIN_LEN {
            return Err(ConfigError::SequenceTooShort {
                len: ports.len(),
                min: Self::MIN_LEN,
            });
        }

        let mut seen = HashSet::with_capacity(ports.len());
        for &port in &ports {
            if port == 0 {
                return Err(ConfigError::ZeroPort { role: "knock" });
            }
            if !seen.insert(port) {
                return Err(ConfigError::DuplicatePort { port });
            }
        }

        Ok(Self { ports })
    }

    /// Port that opens a sequence.
    pub fn first(&self) -> u16 {
        self.ports[0]
    }

    /// Port expected at `index`, if the sequence is that long.
    pub fn port_at(&self, index: usize) -> Option<u16> {
        self.ports.get(index).copied()
    }

    /// Number of knocks required.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Always false; a valid sequence has at least two ports.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Whether `port` is one of the knock ports.
    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// All ports in knock order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

impl Default for KnockSequence {
    fn default() -> Self {
        Self {
            ports: vec![1234, 5678, 9012],
        }
    }
}

impl TryFrom<Vec<u16>> for KnockSequence {
    type Error = ConfigError;

    fn try_from(ports: Vec<u16>) -> Result<Self, Self::Error> {
        Self::new(ports)
    }
}

/// Parses the comma-separated form used on the command line: `1234,5678,9012`.
impl FromStr for KnockSequence {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ports = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u16>()
                    .map_err(|_| ConfigError::InvalidPort(part.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(ports)
    }
}

impl fmt::Display for KnockSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ports = self.ports.iter();
        if let Some(first) = ports.next() {
            write!(f, "{}", first)?;
        }
        for port in ports {
            write!(f, ",{}", port)?;
        }
        Ok(())
    }
}
