//! Available-memory probes

use std::io;
use std::path::PathBuf;

/// Reports memory available for a toolchain build
pub trait MemoryProbe: Send + Sync {
    /// Available memory in megabytes
    fn available_mb(&self) -> io::Result<u64>;
}

/// Reads `MemAvailable` from `/proc/meminfo`
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcMeminfo {
    fn available_mb(&self) -> io::Result<u64> {
        let content = std::fs::read_to_string(&self.path)?;
        parse_mem_available(&content).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no MemAvailable line in {}", self.path.display()),
            )
        })
    }
}

/// A fixed amount, for tests and for hosts without `/proc`
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn available_mb(&self) -> io::Result<u64> {
        Ok(self.0)
    }
}

fn parse_mem_available(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb / 1024)
    })
}
