//! CLI error types.

use std::fmt;

use pairlink_tunnel::TunnelError;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// A tunnel operation failed.
    Tunnel(TunnelError),
    /// Invalid configuration.
    Config(String),
    /// Output formatting error.
    Format(String),
    /// IO error.
    Io(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tunnel(e) => write!(f, "{e}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Format(msg) => write!(f, "format error: {msg}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tunnel(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<TunnelError> for CliError {
    fn from(err: TunnelError) -> Self {
        Self::Tunnel(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_tunnel::Step;

    #[test]
    fn tunnel_error_display_names_step() {
        let err = CliError::from(
            TunnelError::InterfaceExists("wg0".into()).at_step(Step::CreateInterface),
        );
        let text = err.to_string();
        assert!(text.contains("create-interface"));
        assert!(text.contains("wg0"));
    }

    #[test]
    fn cli_error_display_config() {
        let err = CliError::Config("step timeout must be positive".into());
        assert_eq!(
            err.to_string(),
            "configuration error: step timeout must be positive"
        );
    }

    #[test]
    fn cli_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let cli_err = CliError::from(io_err);
        assert!(matches!(cli_err, CliError::Io(_)));
    }
}
