//! `iptables` backend.
//!
//! Every primitive first probes with `-C`: the mutation only runs when the
//! rule is absent (insert) or present (delete), which makes repeated calls
//! no-ops. Allow rules go to the head of the chain with `-I` so they precede
//! the default-deny rule appended with `-A`. IPv6 sources go through
//! `ip6tables`.

use crate::domain::FirewallError;
use crate::ports::FirewallBackend;
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// `iptables -C` exit status when the rule does not exist.
const RULE_MISSING_STATUS: i32 = 1;

/// Where and how rules are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesSettings {
    /// IPv4 tool.
    pub iptables: PathBuf,
    /// IPv6 tool.
    pub ip6tables: PathBuf,
    /// Chain holding the rules.
    pub chain: String,
    /// Protocol of the protected port.
    pub protocol: String,
    /// Also install default-deny through `ip6tables`.
    pub ipv6: bool,
}

impl Default for IptablesSettings {
    fn default() -> Self {
        Self {
            iptables: PathBuf::from("iptables"),
            ip6tables: PathBuf::from("ip6tables"),
            chain: "INPUT".to_string(),
            protocol: "tcp".to_string(),
            ipv6: true,
        }
    }
}

/// Rule-table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// `-C`
    Check,
    /// `-A`
    Append,
    /// `-I`
    Insert,
    /// `-D`
    Delete,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            Self::Check => "-C",
            Self::Append => "-A",
            Self::Insert => "-I",
            Self::Delete => "-D",
        }
    }
}

/// Firewall backend driving `iptables`/`ip6tables`.
#[derive(Debug, Clone, Default)]
pub struct IptablesFirewall {
    settings: IptablesSettings,
}

impl IptablesFirewall {
    /// Create a backend with `settings`.
    pub fn new(settings: IptablesSettings) -> Self {
        Self { settings }
    }

    /// The active settings.
    pub fn settings(&self) -> &IptablesSettings {
        &self.settings
    }

    /// Match part of the default-deny rule for `port`.
    pub fn deny_rule(&self, port: u16) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.settings.protocol.clone(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }

    /// Match part of the allow rule for `address` on `port`.
    pub fn allow_rule(&self, address: IpAddr, port: u16) -> Vec<String> {
        vec![
            "-s".to_string(),
            address.to_string(),
            "-p".to_string(),
            self.settings.protocol.clone(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }

    /// Full argument list for `action` on `rule`.
    pub fn command_args(&self, action: RuleAction, rule: &[String]) -> Vec<String> {
        // -w waits for the xtables lock instead of failing
        let mut args = vec![
            "-w".to_string(),
            action.flag().to_string(),
            self.settings.chain.clone(),
        ];
        args.extend(rule.iter().cloned());
        args
    }

    /// Tool that manages rules for `address`.
    pub fn program_for(&self, address: IpAddr) -> &Path {
        match address {
            IpAddr::V4(_) => &self.settings.iptables,
            IpAddr::V6(_) => &self.settings.ip6tables,
        }
    }

    /// Programs default-deny is installed through.
    fn deny_programs(&self) -> Vec<&Path> {
        let mut programs = vec![self.settings.iptables.as_path()];
        if self.settings.ipv6 {
            programs.push(self.settings.ip6tables.as_path());
        }
        programs
    }

    async fn run(&self, program: &Path, args: &[String]) -> Result<Output, FirewallError> {
        debug!(command = %render(program, args), "running firewall command");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| FirewallError::Spawn {
                command: render(program, args),
                source,
            })
    }

    async fn rule_exists(&self, program: &Path, rule: &[String]) -> Result<bool, FirewallError> {
        let args = self.command_args(RuleAction::Check, rule);
        let output = self.run(program, &args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(RULE_MISSING_STATUS) => Ok(false),
            _ => Err(command_failed(program, &args, &output)),
        }
    }

    async fn apply(
        &self,
        program: &Path,
        action: RuleAction,
        rule: &[String],
    ) -> Result<(), FirewallError> {
        let args = self.command_args(action, rule);
        let output = self.run(program, &args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(command_failed(program, &args, &output))
        }
    }

    async fn ensure_present(
        &self,
        program: &Path,
        action: RuleAction,
        rule: &[String],
    ) -> Result<(), FirewallError> {
        if self.rule_exists(program, rule).await? {
            return Ok(());
        }
        self.apply(program, action, rule).await
    }

    async fn ensure_absent(&self, program: &Path, rule: &[String]) -> Result<(), FirewallError> {
        if !self.rule_exists(program, rule).await? {
            return Ok(());
        }
        self.apply(program, RuleAction::Delete, rule).await
    }
}

#[async_trait]
impl FirewallBackend for IptablesFirewall {
    async fn set_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        let rule = self.deny_rule(port);
        for program in self.deny_programs() {
            self.ensure_present(program, RuleAction::Append, &rule)
                .await?;
        }
        Ok(())
    }

    async fn clear_default_deny(&self, port: u16) -> Result<(), FirewallError> {
        let rule = self.deny_rule(port);
        for program in self.deny_programs() {
            self.ensure_absent(program, &rule).await?;
        }
        Ok(())
    }

    async fn insert_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        let rule = self.allow_rule(address, port);
        self.ensure_present(self.program_for(address), RuleAction::Insert, &rule)
            .await
    }

    async fn remove_allow(&self, address: IpAddr, port: u16) -> Result<(), FirewallError> {
        let rule = self.allow_rule(address, port);
        self.ensure_absent(self.program_for(address), &rule).await
    }
}

fn render(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn command_failed(program: &Path, args: &[String], output: &Output) -> FirewallError {
    FirewallError::CommandFailed {
        command: render(program, args),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}
