use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex_lite::Regex;
use tokio::sync::mpsc;

use super::ChatConn;
use super::ChatEvent;
use super::ChatTarget;
use crate::errors::Error;
use crate::errors::Result;

const DEFAULT_MAX_MESSAGE_LEN: usize = 4_000;

fn mention_regex() -> &'static Regex {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    MENTION.get_or_init(|| Regex::new(r"^@(\S+)$").expect("valid mention pattern"))
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub target: ChatTarget,
    pub text: String,
}

#[derive(Default)]
struct MemState {
    messages: HashMap<String, StoredMessage>,
    order: Vec<String>,
    archived: Vec<ChatTarget>,
    next_id: u64,
    update_count: u64,
    event_tx: Option<mpsc::Sender<ChatEvent>>,
    closed: bool,
}

/// In-memory chat adapter. Messages land in a map keyed by synthetic ids so
/// tests can assert on sends, edits, and ordering without a network.
#[derive(Clone)]
pub struct MemConn {
    state: Arc<Mutex<MemState>>,
    max_message_len: usize,
}

impl MemConn {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    pub fn with_max_message_len(max_message_len: usize) -> Self {
        Self {
            max_message_len,
            ..Self::new()
        }
    }

    /// Feeds an event into the stream returned by `connect`.
    pub async fn inject(&self, event: ChatEvent) {
        let tx = {
            let state = self.state.lock().expect("mem conn state");
            state.event_tx.clone()
        };
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn message(&self, id: &str) -> Option<StoredMessage> {
        let state = self.state.lock().expect("mem conn state");
        state.messages.get(id).cloned()
    }

    /// All messages posted to `target`, in send order, edits applied.
    pub fn messages_in(&self, target: &ChatTarget) -> Vec<StoredMessage> {
        let state = self.state.lock().expect("mem conn state");
        state
            .order
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|message| &message.target == target)
            .cloned()
            .collect()
    }

    pub fn message_count(&self) -> usize {
        let state = self.state.lock().expect("mem conn state");
        state.order.len()
    }

    /// How many edits have been applied, across all messages.
    pub fn update_count(&self) -> u64 {
        let state = self.state.lock().expect("mem conn state");
        state.update_count
    }

    pub fn archived(&self) -> Vec<ChatTarget> {
        let state = self.state.lock().expect("mem conn state");
        state.archived.clone()
    }

    /// Polls until some message contains `needle` or `timeout` elapses.
    pub async fn wait_for_message(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().expect("mem conn state");
                if state
                    .messages
                    .values()
                    .any(|message| message.text.contains(needle))
                {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn store(&self, target: &ChatTarget, text: &str) -> Result<String> {
        let mut state = self.state.lock().expect("mem conn state");
        if state.closed {
            return Err(Error::send_failed("connection closed"));
        }
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.messages.insert(
            id.clone(),
            StoredMessage {
                target: target.clone(),
                text: text.to_string(),
            },
        );
        state.order.push(id.clone());
        Ok(id)
    }
}

impl Default for MemConn {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatConn for MemConn {
    async fn connect(&self) -> Result<mpsc::Receiver<ChatEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().expect("mem conn state");
        state.event_tx = Some(tx);
        Ok(rx)
    }

    async fn send(&self, target: &ChatTarget, text: &str) -> Result<()> {
        self.store(target, text)?;
        Ok(())
    }

    async fn send_with_id(&self, target: &ChatTarget, text: &str) -> Result<String> {
        self.store(target, text)
    }

    async fn update(&self, target: &ChatTarget, id: &str, text: &str) -> Result<()> {
        let mut state = self.state.lock().expect("mem conn state");
        let Some(message) = state.messages.get_mut(id) else {
            return Err(Error::send_failed(format!("unknown message id {id}")));
        };
        message.target = target.clone();
        message.text = text.to_string();
        state.update_count += 1;
        Ok(())
    }

    async fn archive(&self, target: &ChatTarget) -> Result<()> {
        let mut state = self.state.lock().expect("mem conn state");
        state.archived.push(target.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("mem conn state");
        state.closed = true;
        state.event_tx = None;
        Ok(())
    }

    fn mention_bot(&self) -> String {
        "@termbridge".to_string()
    }

    fn mention(&self, user: &str) -> String {
        format!("@{user}")
    }

    fn parse_mention(&self, token: &str) -> Option<String> {
        mention_regex()
            .captures(token)
            .map(|captures| captures[1].to_string())
    }

    fn unescape(&self, text: &str) -> String {
        text.to_string()
    }

    fn max_message_len(&self) -> usize {
        self.max_message_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_update_and_order() {
        let conn = MemConn::new();
        let target = ChatTarget::channel("C1");
        let id = conn.send_with_id(&target, "one").await.unwrap();
        conn.send(&target, "two").await.unwrap();
        conn.update(&target, &id, "one edited").await.unwrap();

        let messages = conn.messages_in(&target);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "one edited");
        assert_eq!(messages[1].text, "two");
    }

    #[tokio::test]
    async fn update_unknown_id_fails() {
        let conn = MemConn::new();
        let target = ChatTarget::channel("C1");
        assert!(conn.update(&target, "99", "x").await.is_err());
    }

    #[test]
    fn mention_parsing() {
        let conn = MemConn::new();
        assert_eq!(conn.parse_mention("@alice"), Some("alice".to_string()));
        assert_eq!(conn.parse_mention("alice"), None);
    }
}
