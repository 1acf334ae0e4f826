mod screen;
mod tmux;

pub use screen::escape_backticks;
pub use screen::strip_csi;
pub use screen::window;
pub use tmux::TmuxDriver;
pub use tmux::preflight;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TerminalSize;
use crate::errors::Result;

/// Capability handle over a detached terminal multiplexer session.
///
/// The multiplexer owns the pty, which is what makes `hardcopy` a cheap
/// "current screen" probe instead of a racy stream read, and what lets
/// `stop` tear everything down without having to interrupt a blocked read.
/// The production implementation is [`TmuxDriver`]; tests substitute their
/// own.
#[async_trait]
pub trait TerminalDriver: Send + Sync {
    /// Launches a detached multiplexer session of the given window size
    /// running `command` under a shell, with logging to a private file.
    async fn start(&self, size: TerminalSize, command: &str) -> Result<()>;

    /// True iff the multiplexer session still exists.
    async fn active(&self) -> bool;

    /// Delivers `text` as if typed, newlines and control sequences intact.
    /// Used for multi-character strings so nothing passes through shell
    /// quoting key by key.
    async fn paste(&self, text: &str) -> Result<()>;

    /// Sends a short raw byte sequence (typically a single control byte).
    async fn send_keys(&self, raw: &[u8]) -> Result<()>;

    /// Returns the visible screen as newline-delimited text.
    async fn hardcopy(&self) -> Result<String>;

    /// Kills the multiplexer session if alive and removes all temp files.
    /// Idempotent.
    async fn stop(&self) -> Result<()>;
}

/// Creates one fresh driver per session. The dispatcher holds this as a
/// capability so tests can hand sessions a scripted terminal.
pub trait TerminalFactory: Send + Sync {
    fn create(&self) -> Arc<dyn TerminalDriver>;
}

pub struct TmuxFactory;

impl TerminalFactory for TmuxFactory {
    fn create(&self) -> Arc<dyn TerminalDriver> {
        Arc::new(TmuxDriver::new())
    }
}
