use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;

use super::Session;
use super::SessionState;
use crate::terminal::escape_backticks;
use crate::terminal::strip_csi;
use crate::terminal::window;

/// Mirrors the terminal screen into the session's terminal target: capture,
/// shape, diff against the last sent text, then edit in place or post a
/// fresh message. One tick, at most one chat call; bursty program output is
/// coalesced by the fixed tick.
pub(super) async fn run(session: Arc<Session>) {
    let cancel = session.cancel.clone();
    let mut renderer = Renderer::new(session);
    let mut ticker = tokio::time::interval(renderer.session.settings.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(session = %renderer.session.config.id, "output pump started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // One final capture so the last screen the program drew makes
                // it into the chat before teardown.
                renderer.tick().await;
                break;
            }
            _ = ticker.tick() => renderer.tick().await,
        }
    }
    debug!(session = %renderer.session.config.id, "output pump exiting");
}

struct Renderer {
    session: Arc<Session>,
    /// Edit target: the last posted message holding the screen.
    message_id: Option<String>,
    last_sent: String,
}

impl Renderer {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            message_id: None,
            last_sent: String::new(),
        }
    }

    async fn tick(&mut self) {
        if self.session.state() == SessionState::Closed {
            return;
        }
        let raw = match self.session.terminal.hardcopy().await {
            Ok(raw) => raw,
            Err(err) => {
                // The liveness watcher decides whether this is fatal.
                debug!(session = %self.session.config.id, "hardcopy failed: {err}");
                return;
            }
        };
        let screen = escape_backticks(&window(
            &strip_csi(&raw),
            self.session.config.window_mode,
            self.session.config.size.rows(),
        ));
        if screen == self.last_sent {
            return;
        }

        let conn = &self.session.conn;
        let target = &self.session.config.terminal;
        let max_len = conn.max_message_len();
        let body = code_block(&screen);

        let edit_target = self.message_id.clone();
        let result = match edit_target {
            Some(id) if body.len() <= max_len => conn.update(target, &id, &body).await,
            // Either no message yet, or the edit target is at capacity: the
            // old message is frozen and a fresh one (holding as much of the
            // screen tail as fits) becomes the edit target.
            _ => conn
                .send_with_id(target, &fit_tail(&screen, max_len))
                .await
                .map(|id| {
                    self.message_id = Some(id);
                }),
        };
        match result {
            Ok(()) => {
                self.last_sent = screen;
                // A changed screen counts as session activity.
                self.session.touch_activity();
            }
            Err(err) => {
                // Leave last_sent untouched so the next tick retries.
                warn!(session = %self.session.config.id, "cannot render screen: {err}");
            }
        }
    }
}

fn code_block(screen: &str) -> String {
    format!("```\n{screen}\n```")
}

/// Drops lines from the top until the code block fits the message budget.
/// Trailing blank padding goes first; after that the bottom of the screen is
/// where the action is.
fn fit_tail(screen: &str, max_len: usize) -> String {
    let mut lines: Vec<&str> = screen.lines().collect();
    while code_block(&lines.join("\n")).len() > max_len
        && lines.last().is_some_and(|line| line.trim().is_empty())
    {
        lines.pop();
    }
    loop {
        let body = code_block(&lines.join("\n"));
        if body.len() <= max_len || lines.is_empty() {
            return body;
        }
        lines.remove(0);
    }
}
