//! Rendering command results for a terminal or for scripts.
//!
//! Every result type is `Serialize` for `--format json` and implements
//! [`TableDisplay`] for the default human-readable view.

use std::io::Write;

use pairlink_tunnel::{InterfaceStatus, PublicKey, TunnelReport, TunnelStatus};
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

/// Writes command results in the selected [`Format`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Formatter for `format`.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Writes `value` and flushes, so long-running commands show results
    /// before they block.
    ///
    /// # Errors
    ///
    /// `Format` if JSON encoding fails, `Io` if the writer does.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        if self.format == Format::Json {
            serde_json::to_writer_pretty(&mut *writer, value)
                .map_err(|e| CliError::Format(format!("cannot encode JSON: {e}")))?;
            writeln!(writer)?;
        } else {
            value.write_table(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// [`write`](Self::write) into a string.
    ///
    /// # Errors
    ///
    /// As for `write`.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(e.to_string()))
    }
}

/// Human-readable rendering.
pub trait TableDisplay {
    /// Writes `self` for a terminal.
    ///
    /// # Errors
    ///
    /// `Io` if the writer fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

impl TableDisplay for TunnelReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        let outcome = if self.changed { "changed" } else { "unchanged" };
        writeln!(writer, "Interface:   {} ({outcome})", self.interface)?;
        if let Some(key) = &self.public_key {
            writeln!(writer, "Public key:  {key}")?;
        }
        if !self.steps.is_empty() {
            let steps: Vec<String> = self.steps.iter().map(ToString::to_string).collect();
            writeln!(writer, "Steps:       {}", steps.join(", "))?;
        }
        Ok(())
    }
}

impl TableDisplay for TunnelStatus {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Interface {}", self.interface)?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Managed:     {}", yes_no(self.managed))?;
        writeln!(writer, "State:       {:?}", self.state)?;
        writeln!(writer, "Up:          {}", yes_no(self.up))?;
        match &self.live {
            Some(live) => write_live(writer, live)?,
            None => writeln!(writer, "Live:        not present")?,
        }
        Ok(())
    }
}

fn write_live<W: Write>(writer: &mut W, live: &InterfaceStatus) -> Result<(), CliError> {
    let key = live
        .public_key
        .as_ref()
        .map_or_else(|| "(none)".to_string(), ToString::to_string);
    writeln!(writer, "Public key:  {key}")?;
    if let Some(port) = live.listen_port {
        writeln!(writer, "Listening:   {port}")?;
    }
    writeln!(writer)?;

    if live.peers.is_empty() {
        writeln!(writer, "No peers")?;
        return Ok(());
    }
    writeln!(
        writer,
        "{:<12}  {:<24}  {:<32}  {:>12}  {:>10}  {:>10}",
        "PEER", "ENDPOINT", "ALLOWED IPS", "HANDSHAKE", "RX", "TX"
    )?;
    writeln!(writer, "{}", "─".repeat(108))?;
    for peer in &live.peers {
        let allowed: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
        writeln!(
            writer,
            "{:<12}  {:<24}  {:<32}  {:>12}  {:>10}  {:>10}",
            peer.public_key.short(),
            peer.endpoint.as_deref().unwrap_or("-"),
            truncate(&allowed.join(","), 32),
            peer.last_handshake
                .map_or_else(|| "never".to_string(), |t| t.to_string()),
            peer.rx_bytes,
            peer.tx_bytes,
        )?;
    }
    Ok(())
}

/// An identity's public key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    /// Identity name.
    pub identity: String,
    /// Public key.
    pub public_key: PublicKey,
    /// Whether the key was created by this command.
    pub created: bool,
}

impl TableDisplay for KeyInfo {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{}", self.public_key)?;
        Ok(())
    }
}

/// A rendered tunnel configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedConfig {
    /// Interface name.
    pub interface: String,
    /// Configuration text in `setconf` format.
    pub config: String,
}

impl TableDisplay for RenderedConfig {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        write!(writer, "{}", self.config)?;
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_tunnel::{InterfaceState, PeerStatus, Step};

    fn report() -> TunnelReport {
        TunnelReport {
            interface: "wg0".into(),
            public_key: Some(PublicKey::from_bytes_array([1; 32])),
            changed: true,
            steps: vec![Step::CreateInterface, Step::ApplyConfig],
        }
    }

    #[test]
    fn report_table_lists_steps() {
        let text = OutputFormat::new(Format::Table)
            .to_string(&report())
            .expect("render");
        assert!(text.contains("wg0 (changed)"));
        assert!(text.contains("create-interface, apply-config"));
    }

    #[test]
    fn report_json_uses_snake_case_steps() {
        let text = OutputFormat::new(Format::Json)
            .to_string(&report())
            .expect("render");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["steps"][0], "create_interface");
        assert_eq!(value["changed"], true);
    }

    #[test]
    fn status_table_shows_peers() {
        let status = TunnelStatus {
            interface: "wg0".into(),
            managed: true,
            state: InterfaceState::Configured,
            up: true,
            live: Some(InterfaceStatus {
                name: "wg0".into(),
                public_key: Some(PublicKey::from_bytes_array([1; 32])),
                listen_port: Some(51820),
                peers: vec![PeerStatus {
                    public_key: PublicKey::from_bytes_array([2; 32]),
                    endpoint: Some("203.0.113.5:51820".into()),
                    allowed_ips: vec!["10.13.13.2/32".parse().expect("cidr")],
                    last_handshake: None,
                    rx_bytes: 10,
                    tx_bytes: 20,
                    persistent_keepalive: None,
                }],
            }),
        };
        let text = OutputFormat::default().to_string(&status).expect("render");
        assert!(text.contains("Listening:   51820"));
        assert!(text.contains("203.0.113.5:51820"));
        assert!(text.contains("never"));
    }

    #[test]
    fn status_table_without_device() {
        let status = TunnelStatus {
            interface: "wg0".into(),
            managed: false,
            state: InterfaceState::Absent,
            up: false,
            live: None,
        };
        let text = OutputFormat::default().to_string(&status).expect("render");
        assert!(text.contains("not present"));
    }

    #[test]
    fn truncate_long_strings() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("10.0.0.0/8,10.1.0.0/16", 10), "10.0.0....");
    }
}
