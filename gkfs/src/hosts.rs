//! The shared hosts file through which daemons announce themselves.
//!
//! Each line is `<hostname> <address>`. A host's id is its line index, so
//! every process reading the same file agrees on the numbering.

use crate::distributor::HostId;
use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub id: HostId,
    pub hostname: String,
    pub addr: SocketAddr,
}

pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes and gethostname NUL-terminates
    // on success
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn parse_hosts(content: &str) -> Result<Vec<HostEntry>> {
    let mut hosts = Vec::new();
    let mut seen = HashSet::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hostname), Some(addr), None) = (fields.next(), fields.next(), fields.next())
        else {
            bail!("hosts file line {}: expected '<hostname> <address>'", line_no + 1);
        };
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("hosts file line {}: bad address '{}'", line_no + 1, addr))?;
        if !seen.insert(addr) {
            bail!("hosts file line {}: duplicate address {}", line_no + 1, addr);
        }
        hosts.push(HostEntry {
            id: hosts.len() as HostId,
            hostname: hostname.to_string(),
            addr,
        });
    }
    Ok(hosts)
}

pub fn read_hosts(path: &Path) -> Result<Vec<HostEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read hosts file: {}", path.display()))?;
    let hosts = parse_hosts(&content)?;
    if hosts.is_empty() {
        bail!("hosts file {} lists no daemons", path.display());
    }
    Ok(hosts)
}

/// A daemon's line in the hosts file, removed again on drop.
pub struct HostRegistration {
    path: PathBuf,
    line: String,
}

impl HostRegistration {
    pub fn register(path: &Path, hostname: &str, addr: SocketAddr) -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(path) {
            let existing = parse_hosts(&content)?;
            if existing.iter().any(|h| h.addr == addr) {
                bail!(
                    "address {} is already registered in {}",
                    addr,
                    path.display()
                );
            }
        }

        let line = format!("{} {}", hostname, addr);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open hosts file: {}", path.display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to write hosts file: {}", path.display()))?;
        info!("Registered {} in hosts file {}", line, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            line,
        })
    }

    fn unregister(&self) -> std::io::Result<()> {
        let content = std::fs::read_to_string(&self.path)?;
        let remaining: Vec<&str> = content
            .lines()
            .filter(|l| l.trim() != self.line)
            .filter(|l| !l.trim().is_empty())
            .collect();
        if remaining.is_empty() {
            std::fs::remove_file(&self.path)
        } else {
            std::fs::write(&self.path, remaining.join("\n") + "\n")
        }
    }
}

impl Drop for HostRegistration {
    fn drop(&mut self) {
        match self.unregister() {
            Ok(()) => info!("Removed {} from hosts file", self.line),
            Err(e) => warn!(
                "Failed to remove {} from hosts file {}: {}",
                self.line,
                self.path.display(),
                e
            ),
        }
    }
}
