//! # pairlink-cli
//!
//! Command-line front end for `pairlink-tunnel`.
//!
//! Provides commands for:
//! - Bringing a tunnel up or down from a peer spec file
//! - Holding a tunnel up for the lifetime of the process (`run`)
//! - Inspecting an interface
//! - Rendering the configuration a spec would apply
//! - Managing local identities
//!
//! ```text
//! ┌──────────────┐   ensure_up / ensure_down   ┌─────────────────┐   ip, wg   ┌──────┐
//! │ pairlink-cli │────────────────────────────►│ pairlink-tunnel │───────────►│ host │
//! └──────────────┘                             └─────────────────┘            └──────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, Format, SpecArgs};
pub use error::CliError;
pub use output::OutputFormat;
