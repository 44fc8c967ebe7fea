//! TCP port ranges and OS-level availability checks

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::str::FromStr;
use thiserror::Error;

/// Try binding `host:port`; the test listener is dropped immediately
pub fn is_port_available(host: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(host, port)).is_ok()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("Invalid port range '{0}', expected START-END")]
    Invalid(String),

    #[error("Port range start {start} is greater than end {end}")]
    Inverted { start: u16, end: u16 },

    #[error("Port range cannot include port 0")]
    ZeroStart,
}

/// Inclusive port range, written `START-END`; never empty and never
/// includes port 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if start == 0 {
            return Err(PortRangeError::ZeroStart);
        }
        if start > end {
            return Err(PortRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn port_count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Every port in the range, starting at a random offset and wrapping
    pub fn scan_from_random(&self) -> impl Iterator<Item = u16> {
        let len = self.port_count();
        let offset = rand::random::<usize>() % len;
        let start = self.start;
        (0..len).map(move |i| start + ((offset + i) % len) as u16)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 1024,
            end: 65535,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| PortRangeError::Invalid(s.to_string()))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| PortRangeError::Invalid(s.to_string()))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse() {
        let range: PortRange = "20000-20010".parse().unwrap();
        assert_eq!((range.start(), range.end()), (20000, 20010));
        assert_eq!(range.port_count(), 11);
        assert_eq!(range.to_string(), "20000-20010");

        assert!("20010-20000".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());
        assert!("1-70000".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_port_zero_rejected() {
        assert_eq!(PortRange::new(0, 100), Err(PortRangeError::ZeroStart));
        assert_eq!("0-65535".parse::<PortRange>(), Err(PortRangeError::ZeroStart));
        assert!(serde_json::from_str::<PortRange>("\"0-10\"").is_err());

        let single = PortRange::new(1, 1).unwrap();
        assert_eq!(single.scan_from_random().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_default_is_unprivileged_range() {
        let range = PortRange::default();
        assert!(!range.contains(1023));
        assert!(range.contains(1024));
        assert!(range.contains(65535));
    }

    #[test]
    fn test_scan_visits_every_port_once() {
        let range = PortRange::new(40000, 40099).unwrap();
        let ports: Vec<u16> = range.scan_from_random().collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(ports.len(), 100);
        assert_eq!(unique.len(), 100);
        assert!(ports.iter().all(|p| range.contains(*p)));
    }

    #[test]
    fn test_bound_port_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("127.0.0.1".parse().unwrap(), port));
        drop(listener);
    }

    #[test]
    fn test_deserialize_from_string() {
        let range: PortRange = serde_json::from_str("\"3000-3005\"").unwrap();
        assert_eq!(range, PortRange::new(3000, 3005).unwrap());
    }
}
