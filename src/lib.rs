//! raydeck - VLESS profile compiler and connection supervisor
//!
//! Parses `vless://` share links into profiles, compiles a profile plus the
//! user settings into xray and tun2socks documents, and supervises both
//! processes along with the OS routing state they need.
//!
//! [`app::App`] is the command surface; the `raydeck` binary is a thin CLI
//! over it.

pub mod app;
pub mod error;
pub mod logging;
pub mod store;
pub mod vpn;

pub use app::App;
pub use error::{Error, Result};
