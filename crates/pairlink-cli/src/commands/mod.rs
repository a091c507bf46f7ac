//! CLI command implementations.
//!
//! - [`tunnel`] - `up`, `down`, `run` and `status`
//! - [`keys`] - `pubkey` and `genkey`
//! - [`render`] - `render`

pub mod keys;
pub mod render;
pub mod tunnel;

pub use keys::KeysCommand;
pub use render::RenderCommand;
pub use tunnel::TunnelCommand;
