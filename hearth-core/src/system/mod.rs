//! Host inspection: resolving the distribution family and version of the
//! machine the runtime is hosted on, and mapping that to the init-system
//! command able to restart a managed service.

use std::fmt;

#[cfg(not(windows))]
use tracing::{debug, info};

mod restart;
pub use restart::{
    host_restart_command, resolve_restart_command, InitSystemRestarter, RestartCommand,
    RestartError, Restarter,
};

#[cfg(not(windows))]
const OS_RELEASE_PATH: &str = "/etc/os-release";
#[cfg(not(windows))]
const REDHAT_RELEASE_PATH: &str = "/etc/redhat-release";

/// Distribution families the restart-command table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Debian,
    Ubuntu,
    Fedora,
    /// CentOS, RHEL and their rebuilds.
    CentOs,
    WindowsNt,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distribution::Debian => "debian",
            Distribution::Ubuntu => "ubuntu",
            Distribution::Fedora => "fedora",
            Distribution::CentOs => "centos",
            Distribution::WindowsNt => "windows-nt",
        };
        f.write_str(name)
    }
}

/// What could be learned about the host. Both fields stay `None` when the
/// host cannot be classified; that is not an error, callers decide the
/// fallback.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub distribution: Option<Distribution>,
    pub version: Option<String>,
}

/// Probe the host once. The result does not change while the process runs,
/// so callers cache it for their own lifetime.
#[cfg(windows)]
pub fn detect() -> HostInfo {
    HostInfo {
        distribution: Some(Distribution::WindowsNt),
        version: None,
    }
}

/// Probe the host once. The result does not change while the process runs,
/// so callers cache it for their own lifetime. Read failures yield an
/// unclassified host, never an error.
#[cfg(not(windows))]
pub fn detect() -> HostInfo {
    if let Ok(content) = std::fs::read_to_string(OS_RELEASE_PATH) {
        if let Some((distribution, version)) = parse_os_release(&content) {
            info!("detected distribution {distribution} (version {version:?})");
            return HostInfo {
                distribution: Some(distribution),
                version,
            };
        }
    }
    // Pre-os-release RHEL family systems only carry the legacy banner file.
    if let Ok(content) = std::fs::read_to_string(REDHAT_RELEASE_PATH) {
        if let Some((distribution, version)) = parse_redhat_release(&content) {
            info!("detected distribution {distribution} (version {version:?})");
            return HostInfo {
                distribution: Some(distribution),
                version,
            };
        }
    }
    debug!("unable to classify host distribution");
    HostInfo::default()
}

#[cfg(not(windows))]
fn parse_os_release(content: &str) -> Option<(Distribution, Option<String>)> {
    let mut id = None;
    let mut id_like = None;
    let mut version = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key.trim() {
            "ID" => id = Some(value.to_ascii_lowercase()),
            "ID_LIKE" => id_like = Some(value.to_ascii_lowercase()),
            "VERSION_ID" => version = Some(value.to_string()),
            _ => {}
        }
    }

    let distribution = id
        .as_deref()
        .and_then(classify_id)
        .or_else(|| classify_id_like(id_like.as_deref()?))?;
    Some((distribution, version))
}

#[cfg(not(windows))]
fn classify_id(id: &str) -> Option<Distribution> {
    match id {
        "debian" => Some(Distribution::Debian),
        "ubuntu" => Some(Distribution::Ubuntu),
        "fedora" => Some(Distribution::Fedora),
        "centos" | "rhel" | "rocky" | "almalinux" => Some(Distribution::CentOs),
        _ => None,
    }
}

#[cfg(not(windows))]
fn classify_id_like(id_like: &str) -> Option<Distribution> {
    let families: Vec<&str> = id_like.split_whitespace().collect();
    if families.iter().any(|f| *f == "rhel" || *f == "centos" || *f == "fedora") {
        return Some(Distribution::CentOs);
    }
    if families.contains(&"ubuntu") {
        return Some(Distribution::Ubuntu);
    }
    if families.contains(&"debian") {
        return Some(Distribution::Debian);
    }
    None
}

#[cfg(not(windows))]
fn parse_redhat_release(content: &str) -> Option<(Distribution, Option<String>)> {
    // e.g. "CentOS release 6.4 (Final)" or
    // "Red Hat Enterprise Linux Server release 6.5 (Santiago)"
    let banner = content.trim();
    if banner.is_empty() {
        return None;
    }
    let distribution = if banner.to_ascii_lowercase().starts_with("fedora") {
        Distribution::Fedora
    } else {
        Distribution::CentOs
    };
    let version = banner
        .split_whitespace()
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))
        .map(|token| token.to_string());
    Some((distribution, version))
}
