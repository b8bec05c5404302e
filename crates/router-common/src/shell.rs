//! Shell command execution utilities for the Linux backends.
//!
//! Commands are run through `/bin/sh -c`, so every interpolated value must
//! go through [`shellquote`].
//!
//! # Example
//!
//! ```ignore
//! use router_common::shell::{self, IPTABLES_CMD, shellquote};
//!
//! let cmd = format!("{} -t nat -A POSTROUTING -o {} -j MASQUERADE",
//!     IPTABLES_CMD, shellquote("wlan0"));
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{RouterError, RouterResult};

/// Path to the `ip` command for interface addressing.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `iptables` command for NAT rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the `sysctl` command.
pub const SYSCTL_CMD: &str = "/sbin/sysctl";

/// Path to the `wpa_supplicant` daemon (upstream association).
pub const WPA_SUPPLICANT_CMD: &str = "/sbin/wpa_supplicant";

/// Path to the `wpa_cli` control utility.
pub const WPA_CLI_CMD: &str = "/sbin/wpa_cli";

/// Path to the `hostapd` daemon (downstream access point).
pub const HOSTAPD_CMD: &str = "/usr/sbin/hostapd";

/// Path to the `dnsmasq` daemon (downstream DHCP server).
pub const DNSMASQ_CMD: &str = "/usr/sbin/dnsmasq";

/// Path to the `dhclient` DHCP client (upstream).
pub const DHCLIENT_CMD: &str = "/sbin/dhclient";

/// Path to the `pkill` command.
pub const PKILL_CMD: &str = "/usr/bin/pkill";

/// Characters that stay special inside double quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Double-quotes `s` for `/bin/sh`, escaping what the shell would
/// still expand.
///
/// ```
/// use router_common::shell::shellquote;
///
/// assert_eq!(shellquote("wlan0"), "\"wlan0\"");
/// assert_eq!(shellquote("cafe$ssid"), "\"cafe\\$ssid\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `-1` when the command was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text for error reports: stderr, falling back to stdout.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Runs `cmd` through `/bin/sh -c` and captures its output.
///
/// Only a spawn failure is an error; a non-zero exit is left to the caller.
pub async fn exec(cmd: &str) -> RouterResult<CommandOutput> {
    tracing::debug!(command = %cmd, "Running command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| RouterError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    if !result.success() {
        tracing::debug!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command exited non-zero"
        );
    }
    Ok(result)
}

/// Like [`exec`], but a non-zero exit is [`RouterError::ShellCommandFailed`].
/// Returns stdout.
pub async fn exec_or_throw(cmd: &str) -> RouterResult<String> {
    let result = exec(cmd).await?;
    if !result.success() {
        tracing::warn!(command = %cmd, exit_code = result.exit_code, "Command failed");
        return Err(RouterError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.diagnostic().to_string(),
        });
    }
    Ok(result.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_interface_names() {
        assert_eq!(shellquote("wlan0"), "\"wlan0\"");
        assert_eq!(shellquote("wlp2s0.100"), "\"wlp2s0.100\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_shellquote_hostile_ssid() {
        assert_eq!(shellquote("$(reboot)"), "\"\\$(reboot)\"");
        assert_eq!(shellquote("`id`"), "\"\\`id\\`\"");
        assert_eq!(shellquote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(shellquote("a\\b"), "\"a\\\\b\"");
        assert_eq!(shellquote("a\nb"), "\"a\\\nb\"");
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let mut out = CommandOutput {
            exit_code: 4,
            stdout: "iptables v1.8.9".to_string(),
            stderr: "Bad rule".to_string(),
        };
        assert!(!out.success());
        assert_eq!(out.diagnostic(), "Bad rule");

        out.stderr.clear();
        assert_eq!(out.diagnostic(), "iptables v1.8.9");
    }

    #[tokio::test]
    async fn test_exec_captures_trimmed_stdout() {
        let out = exec("printf ' 192.168.4.1 \\n'").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "192.168.4.1");
    }

    #[tokio::test]
    async fn test_exec_or_throw_reports_exit_code() {
        match exec_or_throw("echo refused >&2; exit 3").await {
            Err(RouterError::ShellCommandFailed {
                exit_code, output, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(output, "refused");
            }
            other => panic!("expected ShellCommandFailed, got {:?}", other),
        }
    }
}
