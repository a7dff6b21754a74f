use std::{io, process::ExitStatus};

use tracing::info;

use super::{Distribution, HostInfo};

/// Init-system restart mechanisms. The closed set of commands a scanner may
/// issue against the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCommand {
    Systemd,
    SysvInit,
    WindowsService,
}

impl RestartCommand {
    /// Render the command line restarting the given service unit.
    pub fn command_line(&self, unit: &str) -> String {
        match self {
            RestartCommand::Systemd => format!("systemctl restart {unit}"),
            RestartCommand::SysvInit => format!("service {unit} restart"),
            RestartCommand::WindowsService => format!("sc stop {unit} && sc start {unit}"),
        }
    }
}

/// Pure lookup of the restart mechanism for a distribution family and
/// version, no I/O involved.
///
/// Versions compare as the numeric `(major, minor)` tuple of the first two
/// dot-separated components, so "7.0.1406" ranks below "7.1" even though it
/// is the longer string. A version that does not even yield a numeric major
/// component ranks as the lowest version of its family.
pub fn resolve_restart_command(
    distribution: Distribution,
    version: Option<&str>,
) -> RestartCommand {
    match distribution {
        Distribution::Fedora => RestartCommand::Systemd,
        Distribution::WindowsNt => RestartCommand::WindowsService,
        Distribution::Debian => systemd_since(version, (8, 0)),
        Distribution::CentOs => systemd_since(version, (7, 0)),
        Distribution::Ubuntu => systemd_since(version, (15, 4)),
    }
}

/// Convenience over [`resolve_restart_command`] for a probed host; `None`
/// when the distribution could not be classified.
pub fn host_restart_command(host: &HostInfo) -> Option<RestartCommand> {
    Some(resolve_restart_command(
        host.distribution?,
        host.version.as_deref(),
    ))
}

fn systemd_since(version: Option<&str>, threshold: (u64, u64)) -> RestartCommand {
    let at_least = version
        .and_then(parse_major_minor)
        .map(|v| v >= threshold)
        .unwrap_or(false);
    if at_least {
        RestartCommand::Systemd
    } else {
        RestartCommand::SysvInit
    }
}

fn parse_major_minor(version: &str) -> Option<(u64, u64)> {
    let mut components = version.trim().split('.');
    let major: u64 = components.next()?.trim().parse().ok()?;
    // A bare major ("8") or an unparsable minor ranks as minor 0.
    let minor: u64 = components
        .next()
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(0);
    Some((major, minor))
}

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("failed to launch restart command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("restart command `{command}` exited with {status}")]
    Failed { command: String, status: ExitStatus },
}

/// Executes a resolved restart command against the host init system.
/// Failures are returned to the caller, not swallowed.
pub trait Restarter {
    fn restart(&self, command: RestartCommand, unit: &str) -> Result<(), RestartError>;
}

/// The production restarter: shells the rendered command line out.
#[derive(Debug, Default, Clone, Copy)]
pub struct InitSystemRestarter;

impl Restarter for InitSystemRestarter {
    fn restart(&self, command: RestartCommand, unit: &str) -> Result<(), RestartError> {
        let line = command.command_line(unit);
        info!("issuing restart: {line}");
        let status = shell(&line).status().map_err(|source| RestartError::Spawn {
            command: line.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(RestartError::Failed {
                command: line,
                status,
            })
        }
    }
}

#[cfg(unix)]
fn shell(line: &str) -> std::process::Command {
    let mut command = std::process::Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell(line: &str) -> std::process::Command {
    let mut command = std::process::Command::new("cmd");
    command.arg("/C").arg(line);
    command
}
