//! Port-to-process lookup, one strategy per platform.
//!
//! Linux reads the kernel socket tables under `/proc` directly and falls back
//! to `lsof`. Other Unix systems use `lsof`, Windows uses `netstat -ano`.
//! The calling process is never reported as an owner.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Resolves which process is using a TCP port.
pub trait PortInspector: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Pid of a process with a connection on `port` (local or remote side).
    ///
    /// `Ok(None)` means the lookup worked and nothing matched; `Err` means the
    /// lookup itself could not be performed.
    fn owner_pid(&self, port: u16) -> io::Result<Option<u32>>;
}

/// Select the inspector for the current platform.
pub fn platform_inspector() -> Box<dyn PortInspector> {
    #[cfg(target_os = "linux")]
    {
        Box::new(FallbackInspector::new(
            Box::new(ProcNetInspector::default()),
            Box::new(LsofInspector),
        ))
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Box::new(LsofInspector)
    }
    #[cfg(windows)]
    {
        Box::new(NetstatInspector)
    }
}

/// Tries `primary`, and only consults `secondary` when the primary lookup fails.
pub struct FallbackInspector {
    primary: Box<dyn PortInspector>,
    secondary: Box<dyn PortInspector>,
}

impl FallbackInspector {
    pub fn new(primary: Box<dyn PortInspector>, secondary: Box<dyn PortInspector>) -> Self {
        Self { primary, secondary }
    }
}

impl PortInspector for FallbackInspector {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn owner_pid(&self, port: u16) -> io::Result<Option<u32>> {
        match self.primary.owner_pid(port) {
            Ok(found) => Ok(found),
            Err(e) => {
                tracing::debug!(
                    inspector = self.primary.name(),
                    fallback = self.secondary.name(),
                    error = %e,
                    "port lookup failed, using fallback"
                );
                self.secondary.owner_pid(port)
            }
        }
    }
}

// ─── /proc ────────────────────────────────────────────────────────────────────

/// A row of `/proc/net/tcp{,6}` touching the port of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub inode: u64,
    pub listening: bool,
}

/// Reads `/proc/net/tcp` and `/proc/net/tcp6`, then maps socket inodes to
/// pids through `/proc/<pid>/fd`.
#[derive(Debug, Clone)]
pub struct ProcNetInspector {
    root: PathBuf,
}

impl Default for ProcNetInspector {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcNetInspector {
    /// Use an alternative procfs mount (tests point this at a fixture tree).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn socket_entries(&self, port: u16) -> io::Result<Vec<SocketEntry>> {
        let mut entries = Vec::new();
        let mut read_any = false;
        for table in ["net/tcp", "net/tcp6"] {
            match std::fs::read_to_string(self.root.join(table)) {
                Ok(contents) => {
                    read_any = true;
                    entries.extend(parse_proc_net(&contents, port));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if !read_any {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no socket tables under {}", self.root.display()),
            ));
        }
        // Listening sockets are the most likely owners.
        entries.sort_by_key(|e| !e.listening);
        Ok(entries)
    }

    fn pid_for_inode(&self, inode: u64) -> io::Result<Option<u32>> {
        let needle = format!("socket:[{inode}]");
        let own = std::process::id();
        for entry in std::fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == own {
                continue;
            }
            if process_holds_socket(&entry.path().join("fd"), &needle) {
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }
}

/// Other users' fd directories are unreadable; those processes are skipped.
fn process_holds_socket(fd_dir: &Path, needle: &str) -> bool {
    let Ok(fds) = std::fs::read_dir(fd_dir) else {
        return false;
    };
    fds.flatten().any(|fd| {
        std::fs::read_link(fd.path())
            .map(|target| target.as_os_str() == needle)
            .unwrap_or(false)
    })
}

impl PortInspector for ProcNetInspector {
    fn name(&self) -> &str {
        "procfs"
    }

    fn owner_pid(&self, port: u16) -> io::Result<Option<u32>> {
        for entry in self.socket_entries(port)? {
            if let Some(pid) = self.pid_for_inode(entry.inode)? {
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }
}

/// Parse a `/proc/net/tcp`-format table, keeping rows whose local or remote
/// port is `port`. Rows with inode 0 (sockets in TIME_WAIT) have no owner.
pub fn parse_proc_net(contents: &str, port: u16) -> Vec<SocketEntry> {
    const LISTEN: &str = "0A";

    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let local = hex_port(fields[1])?;
            let remote = hex_port(fields[2])?;
            if local != port && remote != port {
                return None;
            }
            let inode: u64 = fields[9].parse().ok()?;
            if inode == 0 {
                return None;
            }
            Some(SocketEntry {
                inode,
                listening: fields[3] == LISTEN && local == port,
            })
        })
        .collect()
}

fn hex_port(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    u16::from_str_radix(port, 16).ok()
}

// ─── lsof ─────────────────────────────────────────────────────────────────────

/// Shells out to `lsof -nP -t -iTCP:<port>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsofInspector;

impl PortInspector for LsofInspector {
    fn name(&self) -> &str {
        "lsof"
    }

    fn owner_pid(&self, port: u16) -> io::Result<Option<u32>> {
        let output = Command::new("lsof")
            .args(["-nP", "-t"])
            .arg(format!("-iTCP:{port}"))
            .output()?;
        // lsof exits 1 both for "no match" and for some errors; an empty
        // stdout is treated as "no owner" either way.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let own = std::process::id();
        Ok(parse_lsof_pids(&stdout).into_iter().find(|&pid| pid != own))
    }
}

/// Parse the terse (`-t`) lsof output: one pid per line.
pub fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

// ─── netstat ──────────────────────────────────────────────────────────────────

/// Shells out to `netstat -ano -p TCP` (Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct NetstatInspector;

impl PortInspector for NetstatInspector {
    fn name(&self) -> &str {
        "netstat"
    }

    fn owner_pid(&self, port: u16) -> io::Result<Option<u32>> {
        let output = Command::new("netstat")
            .args(["-ano", "-p", "TCP"])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "netstat exited with {}",
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let own = std::process::id();
        Ok(parse_netstat(&stdout, port)
            .into_iter()
            .find(|&pid| pid != own && pid != 0))
    }
}

/// Pids from `netstat -ano` rows whose local or foreign port is `port`,
/// listening rows first.
pub fn parse_netstat(stdout: &str, port: u16) -> Vec<u32> {
    let mut rows: Vec<(bool, u32)> = stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            let local = endpoint_port(fields[1])?;
            let foreign = endpoint_port(fields[2]);
            if local != port && foreign != Some(port) {
                return None;
            }
            let pid = fields[4].parse().ok()?;
            let listening = fields[3].eq_ignore_ascii_case("LISTENING") && local == port;
            Some((listening, pid))
        })
        .collect();
    rows.sort_by_key(|(listening, _)| !listening);
    rows.into_iter().map(|(_, pid)| pid).collect()
}

fn endpoint_port(endpoint: &str) -> Option<u16> {
    endpoint.rsplit_once(':')?.1.parse().ok()
}
