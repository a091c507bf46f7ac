//! Error types for tunnel orchestration.

use std::fmt;

use thiserror::Error;

/// A step of the tunnel lifecycle, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Loading or generating the local identity.
    LoadIdentity,
    /// Resolving remote keys and rendering the tunnel configuration.
    RenderConfig,
    /// Creating the virtual interface.
    CreateInterface,
    /// Pushing the rendered configuration into the interface.
    ApplyConfig,
    /// Setting the interface administratively up.
    SetUp,
    /// Assigning the tunnel address.
    AssignAddress,
    /// Installing a route through the interface.
    InstallRoute,
    /// Removing a route.
    RemoveRoute,
    /// Removing the tunnel address.
    RemoveAddress,
    /// Setting the interface administratively down.
    SetDown,
    /// Destroying the interface.
    DestroyInterface,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadIdentity => "load-identity",
            Self::RenderConfig => "render-config",
            Self::CreateInterface => "create-interface",
            Self::ApplyConfig => "apply-config",
            Self::SetUp => "set-up",
            Self::AssignAddress => "assign-address",
            Self::InstallRoute => "install-route",
            Self::RemoveRoute => "remove-route",
            Self::RemoveAddress => "remove-address",
            Self::SetDown => "set-down",
            Self::DestroyInterface => "destroy-interface",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while provisioning or tearing down a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The random source needed for a new private key is unavailable.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// An identity file cannot be read, written, or secured.
    #[error("key storage error for identity '{identity}': {message}")]
    KeyStorage {
        /// Identity name.
        identity: String,
        /// What went wrong.
        message: String,
    },

    /// A tunnel configuration or peer spec violates an invariant.
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    /// A device with this name exists and is not owned by this orchestrator.
    #[error("interface already exists and is not owned by us: {0}")]
    InterfaceExists(String),

    /// The tunnel engine rejected the rendered configuration.
    #[error("failed to apply configuration to {interface}: {message}")]
    Apply {
        /// Interface name.
        interface: String,
        /// Underlying tool failure.
        message: String,
    },

    /// The network stack rejected an interface, address, or route operation.
    #[error("network stack error on {interface}: {message}")]
    Routing {
        /// Interface name.
        interface: String,
        /// Underlying tool failure.
        message: String,
    },

    /// A step did not complete within the configured timeout.
    #[error("step {step} timed out after {timeout_ms}ms")]
    Timeout {
        /// The step that expired.
        step: Step,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The run was cancelled between steps.
    #[error("cancelled before step {0}")]
    Cancelled(Step),

    /// A lifecycle step failed; carries the originating error.
    #[error("step {step} failed: {source}")]
    StepFailed {
        /// The failed step.
        step: Step,
        /// The originating error.
        #[source]
        source: Box<TunnelError>,
    },

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid peer endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Configuration file parse error.
    #[error("parse error at line {line}: {message}")]
    ParseError {
        /// 1-based line number, 0 when the error concerns the whole file.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// The task driving a run panicked or was aborted.
    #[error("orchestration task failed: {0}")]
    TaskFailed(String),

    /// Filesystem error outside key storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Wraps this error with the step it occurred in.
    ///
    /// Errors that already carry a step (`StepFailed`, `Timeout`,
    /// `Cancelled`) are returned unchanged.
    #[must_use]
    pub fn at_step(self, step: Step) -> Self {
        match self {
            Self::StepFailed { .. } | Self::Timeout { .. } | Self::Cancelled(_) => self,
            other => Self::StepFailed {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Returns the step this error is attributed to, if any.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::StepFailed { step, .. } | Self::Timeout { step, .. } => Some(*step),
            Self::Cancelled(step) => Some(*step),
            _ => None,
        }
    }

    /// Returns the originating error, looking through `StepFailed`.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<base64::DecodeError> for TunnelError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}

/// Result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_step_wraps_once() {
        let err = TunnelError::ConfigValidation("no peers".into())
            .at_step(Step::RenderConfig)
            .at_step(Step::CreateInterface);

        assert_eq!(err.step(), Some(Step::RenderConfig));
        assert!(matches!(err.root(), TunnelError::ConfigValidation(_)));
    }

    #[test]
    fn timeout_keeps_its_step() {
        let err = TunnelError::Timeout {
            step: Step::ApplyConfig,
            timeout_ms: 5000,
        }
        .at_step(Step::SetUp);

        assert_eq!(err.step(), Some(Step::ApplyConfig));
    }

    #[test]
    fn step_failed_display_names_step_and_cause() {
        let err = TunnelError::Apply {
            interface: "wg0".into(),
            message: "exit status 1".into(),
        }
        .at_step(Step::ApplyConfig);

        let text = err.to_string();
        assert!(text.contains("apply-config"));
        assert!(text.contains("exit status 1"));
    }
}
