//! Interactive remote shell over pseudo-terminals.

pub mod manager;
pub mod pty;

pub use manager::{ShellManager, DEFAULT_READ_BYTES};
pub use pty::ShellCommand;
