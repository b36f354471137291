//! Operating-system process and socket enumeration.
//!
//! Everything here shells out to the platform's own tools. The parsers are
//! kept separate from the command invocations so they can be tested on any
//! platform.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use super::{PortLister, ProcessEntry, ProcessLister};
use crate::error::{CoreError, Result};

/// Upper bound on any single OS utility invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

static SS_LISTEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^LISTEN\s+\d+\s+\d+\s+\S*:(\d+)\s").unwrap());
static LSOF_LISTEN: Lazy<Regex> = Lazy::new(|| Regex::new(r":(\d+)\s*\(LISTEN\)").unwrap());

/// Executable name of the language server for this platform and architecture.
pub fn executable_name() -> String {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    };
    let arch = if cfg!(target_arch = "aarch64") {
        "arm"
    } else {
        "x64"
    };
    let ext = if cfg!(target_os = "windows") { ".exe" } else { "" };
    format!("language_server_{}_{}{}", os, arch, ext)
}

/// Process listing via `pgrep`, `ps`, or PowerShell.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessLister;

#[async_trait]
impl ProcessLister for SystemProcessLister {
    async fn list(&self, executable: &str) -> Result<Vec<ProcessEntry>> {
        let entries = if cfg!(target_os = "windows") {
            let script = format!(
                "Get-CimInstance Win32_Process -Filter \"name='{}'\" | Select-Object ProcessId,CommandLine | ConvertTo-Json",
                executable
            );
            parse_powershell_processes(&run_powershell(&script).await?)
        } else if cfg!(target_os = "macos") {
            parse_pid_lines(&run("ps", &["-axo", "pid=,command="]).await?)
        } else {
            parse_pid_lines(&run("pgrep", &["-af", executable]).await?)
        };

        let entries: Vec<ProcessEntry> = entries
            .into_iter()
            .filter(|e| e.command_line.contains(executable))
            .collect();
        debug!("Found {} {} processes", entries.len(), executable);
        Ok(entries)
    }
}

/// Listening-port enumeration via `ss`, `lsof`, or PowerShell.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortLister;

#[async_trait]
impl PortLister for SystemPortLister {
    async fn listening_ports(&self, pid: u32) -> Result<Vec<u16>> {
        if cfg!(target_os = "windows") {
            let script = format!(
                "Get-NetTCPConnection -State Listen -OwningProcess {} | Select-Object LocalPort | ConvertTo-Json",
                pid
            );
            return Ok(parse_net_tcp_connections(&run_powershell(&script).await?));
        }

        let pid_arg = pid.to_string();
        let lsof_args = ["-nP", "-iTCP", "-sTCP:LISTEN", "-a", "-p", pid_arg.as_str()];

        if cfg!(target_os = "macos") {
            return Ok(parse_lsof(&run("lsof", &lsof_args).await?));
        }

        match run("ss", &["-tlnp"]).await {
            Ok(output) => {
                let ports = parse_ss(&output, pid);
                if !ports.is_empty() {
                    return Ok(ports);
                }
                debug!("ss reported no ports for pid {}, trying lsof", pid);
            }
            Err(e) => debug!("ss unavailable ({}), trying lsof", e),
        }
        Ok(parse_lsof(&run("lsof", &lsof_args).await?))
    }
}

/// Runs a utility and returns its stdout.
///
/// Exit status 1 is treated as "no matches", which is what `pgrep` and
/// `lsof` report when nothing is found.
async fn run(program: &str, args: &[&str]) -> Result<String> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
        .await
        .map_err(|_| CoreError::command(program, "timed out"))?
        .map_err(|e| CoreError::command(program, e))?;

    if output.status.success() || output.status.code() == Some(1) {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    Err(CoreError::command(
        program,
        format!(
            "exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    ))
}

async fn run_powershell(script: &str) -> Result<String> {
    run(
        "powershell",
        &["-NoProfile", "-NonInteractive", "-Command", script],
    )
    .await
}

/// Parses `<pid> <command line>` lines as printed by `pgrep -af` and `ps`.
pub(crate) fn parse_pid_lines(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, rest) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            Some(ProcessEntry::new(pid, rest.trim()))
        })
        .collect()
}

/// Parses `ConvertTo-Json` output of `Win32_Process` rows.
///
/// PowerShell emits a bare object for a single row and an array otherwise.
pub(crate) fn parse_powershell_processes(output: &str) -> Vec<ProcessEntry> {
    json_rows(output)
        .into_iter()
        .filter_map(|row| {
            let pid = row.get("ProcessId")?.as_u64()?;
            let command_line = row.get("CommandLine")?.as_str()?;
            Some(ProcessEntry::new(u32::try_from(pid).ok()?, command_line))
        })
        .collect()
}

/// Parses `ss -tlnp` output, keeping sockets owned by `pid`.
pub(crate) fn parse_ss(output: &str, pid: u32) -> Vec<u16> {
    let owner = format!("pid={},", pid);
    output
        .lines()
        .filter(|line| line.contains(&owner))
        .filter_map(|line| SS_LISTEN.captures(line)?.get(1)?.as_str().parse().ok())
        .collect()
}

/// Parses `lsof -iTCP -sTCP:LISTEN` output.
pub(crate) fn parse_lsof(output: &str) -> Vec<u16> {
    output
        .lines()
        .filter_map(|line| LSOF_LISTEN.captures(line)?.get(1)?.as_str().parse().ok())
        .collect()
}

/// Parses `Get-NetTCPConnection | ConvertTo-Json` output.
pub(crate) fn parse_net_tcp_connections(output: &str) -> Vec<u16> {
    json_rows(output)
        .into_iter()
        .filter_map(|row| u16::try_from(row.get("LocalPort")?.as_u64()?).ok())
        .collect()
}

fn json_rows(output: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(Value::Array(rows)) => rows,
        Ok(row @ Value::Object(_)) => vec![row],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_name_shape() {
        let name = executable_name();
        assert!(name.starts_with("language_server_"));
        assert!(name.contains("_x64") || name.contains("_arm"));
    }

    #[test]
    fn pid_lines() {
        let output = "  123 /opt/bin/language_server_linux_x64 --csrf_token a\n\
                      456 /usr/bin/other\n\
                      garbage\n";
        let entries = parse_pid_lines(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pid, 123);
        assert_eq!(
            entries[0].command_line,
            "/opt/bin/language_server_linux_x64 --csrf_token a"
        );
    }

    #[test]
    fn powershell_processes() {
        let single = r#"{"ProcessId": 42, "CommandLine": "C:\\x\\language_server_windows_x64.exe"}"#;
        assert_eq!(parse_powershell_processes(single).len(), 1);

        let many = r#"[{"ProcessId": 1, "CommandLine": "a"}, {"ProcessId": 2, "CommandLine": null}]"#;
        let entries = parse_powershell_processes(many);
        assert_eq!(entries, vec![ProcessEntry::new(1, "a")]);

        assert!(parse_powershell_processes("").is_empty());
    }

    #[test]
    fn ss_output() {
        let output = "\
State  Recv-Q Send-Q Local Address:Port  Peer Address:Port Process
LISTEN 0      4096       127.0.0.1:42100      0.0.0.0:*     users:((\"language_server\",pid=900,fd=9))
LISTEN 0      4096            [::1]:42101         [::]:*     users:((\"language_server\",pid=900,fd=10))
LISTEN 0      128               *:22             *:*     users:((\"sshd\",pid=9001,fd=3))
LISTEN 0      4096       127.0.0.1:5000       0.0.0.0:*     users:((\"other\",pid=90,fd=3))
";
        assert_eq!(parse_ss(output, 900), vec![42100, 42101]);
        assert_eq!(parse_ss(output, 9001), vec![22]);
        assert!(parse_ss(output, 1).is_empty());
    }

    #[test]
    fn lsof_output() {
        let output = "\
COMMAND     PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
language_ 900 me   9u  IPv4 0x1      0t0  TCP 127.0.0.1:42100 (LISTEN)
language_ 900 me  10u  IPv6 0x2      0t0  TCP [::1]:42101 (LISTEN)
";
        assert_eq!(parse_lsof(output), vec![42100, 42101]);
    }

    #[test]
    fn net_tcp_output() {
        assert_eq!(parse_net_tcp_connections(r#"{"LocalPort": 5000}"#), vec![5000]);
        assert_eq!(
            parse_net_tcp_connections(r#"[{"LocalPort": 5001}, {"LocalPort": 70000}]"#),
            vec![5001]
        );
    }
}
