//! `render`: print the configuration a spec would apply.

use std::io::Write;

use pairlink_tunnel::{PeerSpec, TunnelOrchestrator};

use crate::cli::SpecArgs;
use crate::error::CliError;
use crate::output::{OutputFormat, RenderedConfig};

/// Render command executor.
pub struct RenderCommand {
    orchestrator: TunnelOrchestrator,
}

impl RenderCommand {
    /// Create a render command.
    #[must_use]
    pub fn new(orchestrator: TunnelOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Render the spec's configuration. The private key is hidden unless
    /// `show_private_key` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec is invalid or keys cannot be loaded.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &SpecArgs,
        show_private_key: bool,
    ) -> Result<(), CliError> {
        let spec = PeerSpec::from_file(&args.spec)?;
        let config = self.orchestrator.render(&spec)?;
        let text = if show_private_key {
            config.to_conf()
        } else {
            config.to_redacted_conf()
        };
        format.write(
            writer,
            &RenderedConfig {
                interface: spec.interface,
                config: text,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_tunnel::{FakeBackend, OrchestratorConfig};

    const SPEC: &str = r#"
interface = "wg0"
identity = "server"
address = "10.13.13.1/32"
listen_port = 51820

[[peers]]
public_key = "KioqKioqKioqKioqKioqKioqKioqKioqKioqKioqKio="
allowed_ips = ["10.13.13.2/32"]
"#;

    fn render(show_private_key: bool) -> (String, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wg0.toml");
        std::fs::write(&path, SPEC).expect("write spec");
        let config = OrchestratorConfig::new(dir.path().join("keys"), dir.path().join("state"));
        let orchestrator =
            TunnelOrchestrator::with_backend(config, FakeBackend::new()).expect("orchestrator");

        let mut out = Vec::new();
        RenderCommand::new(orchestrator.clone())
            .execute(
                &mut out,
                &OutputFormat::default(),
                &SpecArgs { spec: path },
                show_private_key,
            )
            .expect("render");
        let (identity, _) = orchestrator
            .keystore()
            .get_or_create("server")
            .expect("identity");
        (
            String::from_utf8(out).expect("utf8"),
            identity.private_key().to_base64(),
        )
    }

    #[test]
    fn hides_private_key_by_default() {
        let (text, private) = render(false);
        assert!(text.contains("[Peer]"));
        assert!(text.contains("AllowedIPs = 10.13.13.2/32"));
        assert!(!text.contains(&private));
    }

    #[test]
    fn shows_private_key_on_request() {
        let (text, private) = render(true);
        assert!(text.contains(&private));
    }
}
