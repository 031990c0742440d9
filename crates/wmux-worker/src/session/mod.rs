//! Session management: PTY lifecycle, the session registry, reader loops.

pub mod pty;
pub mod registry;

pub use pty::{choose_shell, executable_on_disk, PtySession, ReaderPipe};
pub use registry::SessionRegistry;
