mod mem;

pub use mem::MemConn;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;

/// A (channel, thread) pair. An empty thread means the channel top level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatTarget {
    pub channel: String,
    pub thread: String,
}

impl ChatTarget {
    pub fn new(channel: impl Into<String>, thread: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread: thread.into(),
        }
    }

    pub fn channel(channel: impl Into<String>) -> Self {
        Self::new(channel, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Dm,
    Channel,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub id: String,
    pub channel: String,
    pub channel_type: ChannelType,
    pub thread: String,
    pub user: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(MessageEvent),
    Error(String),
}

/// Chat platform capability set. Implementations exist per platform; the
/// in-memory [`MemConn`] backs the test suite.
#[async_trait]
pub trait ChatConn: Send + Sync {
    /// Opens the event stream. Dropping the receiver ends delivery.
    async fn connect(&self) -> Result<mpsc::Receiver<ChatEvent>>;

    async fn send(&self, target: &ChatTarget, text: &str) -> Result<()>;

    /// Like `send`, but returns the message id so the caller can edit it
    /// in place later.
    async fn send_with_id(&self, target: &ChatTarget, text: &str) -> Result<String>;

    async fn update(&self, target: &ChatTarget, id: &str, text: &str) -> Result<()>;

    async fn archive(&self, target: &ChatTarget) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// The token a user types to address the bot.
    fn mention_bot(&self) -> String;

    fn mention(&self, user: &str) -> String;

    /// Extracts the user id from a mention token, if it is one.
    fn parse_mention(&self, token: &str) -> Option<String>;

    /// Undoes platform escaping (entities, smart quotes) on inbound text.
    fn unescape(&self, text: &str) -> String;

    /// Message-size budget in bytes for one rendered screen.
    fn max_message_len(&self) -> usize;
}
