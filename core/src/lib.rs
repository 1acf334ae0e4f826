//! Session engine for a chat-operated REPL broker: binds chat threads to
//! live terminal-multiplexer sessions, mirrors the screen back into the chat
//! and feeds chat lines in as keystrokes.

pub mod bot;
pub mod chat;
pub mod config;
pub mod errors;
pub mod session;
pub mod share;
pub mod terminal;
pub mod util;

pub use bot::Bot;
pub use bot::SessionRegistry;
pub use config::Config;
pub use config::Platform;
pub use errors::CloseReason;
pub use errors::Error;
pub use errors::Result;
pub use session::Session;
pub use session::SessionConfig;
pub use session::SessionState;
