use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Result of a best-effort status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Active,
    Inactive,
    Unknown,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        })
    }
}

/// Read-only view of live host state. Probes never fail; they degrade to
/// `Unknown`, `None`, or empty results.
pub trait HostProbe {
    fn service_active(&self, unit: &str) -> ProbeStatus;

    /// Trimmed stdout of a successful command.
    fn command_output(&self, program: &str, args: &[&str]) -> Option<String>;

    fn mount_points(&self) -> Vec<PathBuf>;

    fn cache_devices(&self) -> Vec<String>;

    fn is_mount_point(&self, path: &Path) -> bool {
        self.mount_points().iter().any(|m| m == path)
    }
}

/// Probes the running system through systemctl, procfs and sysfs.
pub struct SystemProbe {
    mounts_file: PathBuf,
    sys_block: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/self/mounts"),
            sys_block: PathBuf::from("/sys/block"),
        }
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostProbe for SystemProbe {
    fn service_active(&self, unit: &str) -> ProbeStatus {
        match Command::new("systemctl")
            .args(["is-active", "--quiet", unit])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => ProbeStatus::Active,
            Ok(_) => ProbeStatus::Inactive,
            Err(e) => {
                debug!("systemctl unavailable for {unit}: {e}");
                ProbeStatus::Unknown
            }
        }
    }

    fn command_output(&self, program: &str, args: &[&str]) -> Option<String> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| debug!("{program} unavailable: {e}"))
            .ok()?;
        if !output.status.success() {
            debug!("{program} {} exited with {}", args.join(" "), output.status);
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn mount_points(&self) -> Vec<PathBuf> {
        fs::read_to_string(&self.mounts_file)
            .map(|c| parse_mount_points(&c))
            .unwrap_or_default()
    }

    fn cache_devices(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.sys_block) else {
            return Vec::new();
        };
        let mut devices: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("bcache"))
            .collect();
        devices.sort();
        devices
    }
}

/// Mount targets from a `/proc/mounts`-style table.
pub fn parse_mount_points(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|target| PathBuf::from(unescape_mount_field(target)))
        .collect()
}

/// Undo the kernel's octal escaping (`\040` for space and friends).
fn unescape_mount_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            let value = std::str::from_utf8(digits)
                .ok()
                .filter(|d| d.bytes().all(|b| (b'0'..=b'7').contains(&b)))
                .and_then(|d| u8::from_str_radix(d, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
