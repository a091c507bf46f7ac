//! Tunnel commands: `up`, `down`, `run`, `status`.

use std::io::Write;

use pairlink_tunnel::{PeerSpec, TunnelOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::SpecArgs;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Tunnel command executor.
pub struct TunnelCommand {
    orchestrator: TunnelOrchestrator,
}

impl TunnelCommand {
    /// Create a tunnel command over an orchestrator.
    #[must_use]
    pub fn new(orchestrator: TunnelOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Bring the tunnel up.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec cannot be loaded or any step fails.
    pub async fn up<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &SpecArgs,
    ) -> Result<(), CliError> {
        let spec = PeerSpec::from_file(&args.spec)?;
        let report = self.orchestrator.ensure_up(spec).await?;
        format.write(writer, &report)
    }

    /// Tear the tunnel down.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec cannot be loaded or any step fails.
    pub async fn down<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &SpecArgs,
    ) -> Result<(), CliError> {
        let spec = PeerSpec::from_file(&args.spec)?;
        let report = self.orchestrator.ensure_down(spec).await?;
        format.write(writer, &report)
    }

    /// Bring the tunnel up, hold it until SIGINT or SIGTERM, then tear it down.
    ///
    /// A signal during bring-up cancels it at the next step boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec cannot be loaded, a step fails, or the
    /// bring-up was cancelled.
    pub async fn run<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &SpecArgs,
    ) -> Result<(), CliError> {
        let spec = PeerSpec::from_file(&args.spec)?;
        let token = CancellationToken::new();
        let up = self.orchestrator.ensure_up_with(spec.clone(), token.clone());
        tokio::pin!(up);

        let report = tokio::select! {
            result = &mut up => result?,
            signal = shutdown_signal() => {
                signal?;
                info!(interface = %spec.interface, "signal received during bring-up; cancelling");
                token.cancel();
                let result = up.await;
                if result.is_ok() {
                    self.orchestrator.ensure_down(spec).await?;
                }
                result?;
                return Ok(());
            }
        };
        format.write(writer, &report)?;

        info!(interface = %spec.interface, "tunnel up; waiting for SIGINT or SIGTERM");
        shutdown_signal().await?;
        info!(interface = %spec.interface, "shutting down");

        let report = self.orchestrator.ensure_down(spec).await?;
        format.write(writer, &report)
    }

    /// Show what is known about an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be queried.
    pub async fn status<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        interface: &str,
    ) -> Result<(), CliError> {
        let status = self.orchestrator.status(interface).await?;
        format.write(writer, &status)
    }
}

/// Resolves on SIGINT, or on SIGTERM where supported.
async fn shutdown_signal() -> Result<(), CliError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
