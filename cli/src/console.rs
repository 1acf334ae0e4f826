use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use termbridge_core::Result;
use termbridge_core::chat::ChannelType;
use termbridge_core::chat::ChatConn;
use termbridge_core::chat::ChatEvent;
use termbridge_core::chat::ChatTarget;
use termbridge_core::chat::MessageEvent;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;

const CONSOLE_CHANNEL: &str = "console";
const CONSOLE_USER: &str = "operator";
const MAX_MESSAGE_LEN: usize = 4_000;

/// Local development chat adapter: stdin lines become message events in a
/// single DM-style channel, sends and edits are printed to stdout. Lets the
/// whole bot (dispatcher, sessions, real tmux) be driven from a terminal
/// without any chat platform.
pub struct ConsoleConn {
    next_id: AtomicU64,
    reader_started: Mutex<bool>,
}

impl ConsoleConn {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            reader_started: Mutex::new(false),
        }
    }

    fn fresh_id(&self) -> String {
        format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn print(&self, target: &ChatTarget, id: &str, text: &str, edited: bool) {
        let thread = if target.thread.is_empty() {
            String::new()
        } else {
            format!(" / {}", target.thread)
        };
        let marker = if edited { "edit" } else { "post" };
        println!("--- {marker} {id} [{}{thread}] ---", target.channel);
        println!("{text}");
    }
}

impl Default for ConsoleConn {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatConn for ConsoleConn {
    async fn connect(&self) -> Result<mpsc::Receiver<ChatEvent>> {
        let (tx, rx) = mpsc::channel(64);
        {
            let mut started = self.reader_started.lock().expect("console state");
            if *started {
                return Ok(rx);
            }
            *started = true;
        }
        let counter = Arc::new(AtomicU64::new(0));
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let id = format!("in{}", counter.fetch_add(1, Ordering::SeqCst));
                let event = ChatEvent::Message(MessageEvent {
                    id,
                    channel: CONSOLE_CHANNEL.to_string(),
                    channel_type: ChannelType::Dm,
                    thread: String::new(),
                    user: CONSOLE_USER.to_string(),
                    text: line,
                });
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn send(&self, target: &ChatTarget, text: &str) -> Result<()> {
        self.print(target, &self.fresh_id(), text, false);
        Ok(())
    }

    async fn send_with_id(&self, target: &ChatTarget, text: &str) -> Result<String> {
        let id = self.fresh_id();
        self.print(target, &id, text, false);
        Ok(id)
    }

    async fn update(&self, target: &ChatTarget, id: &str, text: &str) -> Result<()> {
        self.print(target, id, text, true);
        Ok(())
    }

    async fn archive(&self, _target: &ChatTarget) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn mention_bot(&self) -> String {
        "@termbridge".to_string()
    }

    fn mention(&self, user: &str) -> String {
        format!("@{user}")
    }

    fn parse_mention(&self, token: &str) -> Option<String> {
        token.strip_prefix('@').map(str::to_string)
    }

    fn unescape(&self, text: &str) -> String {
        text.to_string()
    }

    fn max_message_len(&self) -> usize {
        MAX_MESSAGE_LEN
    }
}
