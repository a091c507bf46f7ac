//! pairlink binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pairlink_cli::cli::{Cli, Commands};
use pairlink_cli::commands::{KeysCommand, RenderCommand, TunnelCommand};
use pairlink_cli::output::OutputFormat;
use pairlink_tunnel::{CommandBackend, KeyStore, TunnelOrchestrator};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn orchestrator(cli: &Cli) -> Result<TunnelOrchestrator, pairlink_cli::CliError> {
    let backend = CommandBackend::with_paths(&cli.ip_path, &cli.wg_path);
    Ok(TunnelOrchestrator::with_backend(
        cli.orchestrator_config(),
        backend,
    )?)
}

async fn run(cli: Cli) -> Result<(), pairlink_cli::CliError> {
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match &cli.command {
        Commands::Up(args) => {
            let cmd = TunnelCommand::new(orchestrator(&cli)?);
            cmd.up(&mut stdout, &format, args).await?;
        }
        Commands::Down(args) => {
            let cmd = TunnelCommand::new(orchestrator(&cli)?);
            cmd.down(&mut stdout, &format, args).await?;
        }
        Commands::Run(args) => {
            let cmd = TunnelCommand::new(orchestrator(&cli)?);
            cmd.run(&mut stdout, &format, args).await?;
        }
        Commands::Status { interface } => {
            let cmd = TunnelCommand::new(orchestrator(&cli)?);
            cmd.status(&mut stdout, &format, interface).await?;
        }
        Commands::Render {
            spec,
            show_private_key,
        } => {
            let cmd = RenderCommand::new(orchestrator(&cli)?);
            cmd.execute(&mut stdout, &format, spec, *show_private_key)?;
        }
        Commands::Pubkey { identity } => {
            let cmd = KeysCommand::new(KeyStore::new(&cli.key_dir));
            cmd.pubkey(&mut stdout, &format, identity)?;
        }
        Commands::Genkey { identity, force } => {
            let cmd = KeysCommand::new(KeyStore::new(&cli.key_dir));
            cmd.genkey(&mut stdout, &format, identity, *force)?;
        }
    }

    Ok(())
}
