use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::chat::ChannelType;
use crate::chat::ChatConn;
use crate::chat::ChatEvent;
use crate::chat::ChatTarget;
use crate::chat::MessageEvent;
use crate::config::AuthMode;
use crate::config::Config;
use crate::config::ControlMode;
use crate::config::Platform;
use crate::config::TerminalSize;
use crate::config::WindowMode;
use crate::errors::Error;
use crate::errors::Result;
use crate::session::Session;
use crate::session::SessionConfig;
use crate::share;
use crate::terminal;
use crate::terminal::TerminalFactory;
use crate::terminal::TmuxFactory;
use crate::util::random_port;
use crate::util::sanitize_id;

const SHARE_KEYWORD: &str = "share";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const MISCONFIGURED_MESSAGE: &str =
    "It looks like I'm misconfigured: there are no scripts I could run.";

/// All live sessions by id; one writer at creation and deletion, readers for
/// event routing and share-server lookups.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.get(id).cloned()
    }

    /// The session for `id` if it is still accepting input.
    pub async fn get_active(&self, id: &str) -> Option<Arc<Session>> {
        self.get(id).await.filter(|session| session.active())
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    async fn insert(&self, session: Arc<Session>) {
        self.inner
            .write()
            .await
            .insert(session.id().to_string(), session);
    }

    /// Removes `session` from the registry, but only if it is still the
    /// registered entry: a replacement under the same id stays put.
    async fn remove(&self, session: &Arc<Session>) {
        let mut sessions = self.inner.write().await;
        if let Some(current) = sessions.get(session.id()) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(session.id());
            }
        }
    }
}

/// The dispatcher: receives chat events, routes them to live sessions or
/// parses them as new-session triggers, and supervises the registry.
pub struct Bot {
    config: Arc<Config>,
    conn: Arc<dyn ChatConn>,
    terminals: Arc<dyn TerminalFactory>,
    sessions: SessionRegistry,
    cancel: CancellationToken,
}

impl Bot {
    /// Builds a bot against the real multiplexer, verifying upfront that the
    /// binary exists and the script catalog is non-empty.
    pub async fn new(config: Config, conn: Arc<dyn ChatConn>) -> Result<Self> {
        terminal::preflight().await?;
        Self::with_terminal_factory(config, conn, Arc::new(TmuxFactory))
    }

    /// Like `new` but with an injected terminal capability and no binary
    /// preflight. This is the constructor the test suite uses.
    pub fn with_terminal_factory(
        config: Config,
        conn: Arc<dyn ChatConn>,
        terminals: Arc<dyn TerminalFactory>,
    ) -> Result<Self> {
        if config.scripts().is_empty() {
            return Err(Error::config(format!(
                "no scripts found in {}",
                config.script_dir.display()
            )));
        }
        Ok(Self {
            config: Arc::new(config),
            conn,
            terminals,
            sessions: SessionRegistry::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Requests a graceful stop; `run` force-closes every session before it
    /// returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the event loop until shutdown or the event stream ends.
    pub async fn run(&self) -> Result<()> {
        let mut events = self.conn.connect().await?;
        if self.config.share_enabled() {
            share::write_relay_script().await?;
            let server = share::ShareServer::new(self.sessions.clone(), self.config.share_port()?);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = server.run(cancel).await {
                    warn!("share server exited: {err}");
                }
            });
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(ChatEvent::Message(ev)) => {
                        if let Err(err) = self.handle_message(ev).await {
                            warn!("cannot handle message: {err}");
                        }
                    }
                    Some(ChatEvent::Error(err)) => warn!("chat stream error: {err}"),
                    None => break,
                },
            }
        }
        self.close_all_sessions().await;
        self.conn.close().await
    }

    async fn handle_message(&self, ev: MessageEvent) -> Result<()> {
        let text = self.conn.unescape(&ev.text);
        if self.forward_to_session(&ev, &text).await {
            return Ok(());
        }
        if ev.channel_type == ChannelType::Unknown {
            return Ok(());
        }
        // Channels require an explicit mention; DMs do not.
        if ev.channel_type == ChannelType::Channel && !text.contains(&self.conn.mention_bot()) {
            return Ok(());
        }
        match self.parse_trigger(&ev, &text).await {
            Ok(session_config) => self.start_session(session_config).await,
            Err(trigger_err) => self.send_help(&ev, trigger_err).await,
        }
    }

    /// Delivers the message to an active session with the matching id, if
    /// any. Session ids are derived from the (channel, thread) pair, so a
    /// message lands in a session exactly when it is typed where the session
    /// was started.
    async fn forward_to_session(&self, ev: &MessageEvent, text: &str) -> bool {
        let id = session_id(&ev.channel, &ev.thread);
        if let Some(session) = self.sessions.get_active(&id).await {
            session.user_input(&ev.user, text).await;
            return true;
        }
        false
    }

    async fn parse_trigger(
        &self,
        ev: &MessageEvent,
        text: &str,
    ) -> std::result::Result<SessionConfig, TriggerError> {
        let mention = self.conn.mention_bot();
        let mut script: Option<PathBuf> = None;
        let mut share = false;
        let mut control_mode = None;
        let mut window_mode = None;
        let mut auth_mode = None;
        let mut size = None;

        for token in text.split_whitespace() {
            if token == mention {
                continue;
            }
            if let Some(mode) = ControlMode::from_keyword(token) {
                control_mode = Some(mode);
            } else if let Some(mode) = WindowMode::from_keyword(token) {
                window_mode = Some(mode);
            } else if let Some(mode) = AuthMode::from_keyword(token) {
                auth_mode = Some(mode);
            } else if let Some(parsed) = TerminalSize::from_keyword(token) {
                size = Some(parsed);
            } else if self.config.share_enabled() && token == SHARE_KEYWORD && !share
                && script.is_none()
            {
                share = true;
            } else if let Some(path) = self.config.script(token) {
                if script.is_some() || share {
                    return Err(TriggerError::Unknown(token.to_string()));
                }
                script = Some(path);
            } else {
                return Err(TriggerError::Unknown(token.to_string()));
            }
        }

        if script.is_none() && !share {
            return Err(TriggerError::NoScript);
        }

        // Defaults and platform overrides.
        let mut control_mode = control_mode.unwrap_or(if ev.thread.is_empty() {
            self.config.default_control_mode
        } else {
            // Triggered inside an existing thread: anything else would
            // scatter the conversation.
            ControlMode::Thread
        });
        if self.config.platform == Platform::Discord
            && ev.channel_type == ChannelType::Dm
            && control_mode != ControlMode::Channel
        {
            // Discord has no threads in direct messages.
            control_mode = ControlMode::Channel;
        }
        let window_mode = window_mode.unwrap_or(if control_mode == ControlMode::Thread {
            WindowMode::Trim
        } else {
            self.config.default_window_mode
        });
        let auth_mode = auth_mode.unwrap_or(if share {
            AuthMode::OnlyMe
        } else {
            self.config.default_auth_mode
        });
        let size = size.unwrap_or(if control_mode == ControlMode::Thread {
            TerminalSize::Tiny
        } else {
            self.config.default_size
        });

        // Targets and session id per control mode. New threads hang off the
        // triggering message's own id.
        let thread = if ev.thread.is_empty() {
            ev.id.clone()
        } else {
            ev.thread.clone()
        };
        let (id, control, terminal) = match control_mode {
            ControlMode::Channel => (
                session_id(&ev.channel, ""),
                ChatTarget::channel(&ev.channel),
                ChatTarget::channel(&ev.channel),
            ),
            ControlMode::Thread => (
                session_id(&ev.channel, &thread),
                ChatTarget::new(&ev.channel, &thread),
                ChatTarget::new(&ev.channel, &thread),
            ),
            ControlMode::Split => (
                session_id(&ev.channel, &thread),
                ChatTarget::new(&ev.channel, &thread),
                ChatTarget::channel(&ev.channel),
            ),
        };

        let (command, relay_port) = if share {
            let port = random_port()
                .await
                .map_err(|err| TriggerError::Setup(format!("cannot allocate relay port: {err}")))?;
            let host = self
                .config
                .share_host
                .clone()
                .unwrap_or_default();
            (share::relay_command(&id, &host, port), Some(port))
        } else {
            (
                script.expect("script or share is set").display().to_string(),
                None,
            )
        };

        Ok(SessionConfig {
            id,
            owner: ev.user.clone(),
            command,
            control_mode,
            window_mode,
            auth_mode,
            size,
            control,
            terminal,
            relay_port,
        })
    }

    async fn start_session(&self, session_config: SessionConfig) -> Result<()> {
        if self.sessions.get_active(&session_config.id).await.is_some() {
            // At most one active session per id; the trigger was raced by
            // another one and lost.
            return Ok(());
        }
        let session = Session::new(
            session_config,
            Arc::clone(&self.config),
            Arc::clone(&self.conn),
            self.terminals.create(),
        );
        self.sessions.insert(Arc::clone(&session)).await;
        info!(session = %session.id(), "session registered");
        let registry = self.sessions.clone();
        tokio::spawn(async move {
            if let Err(err) = session.run().await {
                warn!(session = %session.id(), "session exited with error: {err}");
            }
            registry.remove(&session).await;
        });
        Ok(())
    }

    async fn send_help(&self, ev: &MessageEvent, trigger_err: TriggerError) -> Result<()> {
        let target = ChatTarget::new(&ev.channel, &ev.thread);
        let scripts = self.config.scripts();
        if scripts.is_empty() {
            return self.conn.send(&target, MISCONFIGURED_MESSAGE).await;
        }
        let text = match trigger_err {
            TriggerError::NoScript => self.help_text(&scripts),
            TriggerError::Unknown(token) => format!(
                "I am not quite sure what you mean by _{token}_.\n\n{}",
                self.help_text(&scripts)
            ),
            TriggerError::Setup(detail) => format!("Cannot start this session: {detail}"),
        };
        self.conn.send(&target, &text).await
    }

    fn help_text(&self, scripts: &[String]) -> String {
        let catalog = scripts
            .iter()
            .map(|name| format!("`{name}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut text = format!(
            "Hi there! I run interactive terminals right here in the chat. Mention me with one \
             of the available scripts to start a session, like so: {} {}\n\nAvailable scripts: \
             {catalog}. Add `thread`, `channel` or `split` to choose where the session runs, \
             `tiny`, `small`, `medium` or `large` for the terminal size, `full` or `trim` for \
             the window mode, and `only-me` or `everyone` for who may type. DM me to keep it \
             private.",
            self.conn.mention_bot(),
            scripts[0],
        );
        if self.config.share_enabled() {
            text.push_str(
                "\n\nThe `share` keyword connects your own terminal instead; the session \
                 prints the connection instructions once it starts.",
            );
        }
        text
    }

    async fn close_all_sessions(&self) {
        for session in self.sessions.all().await {
            info!(session = %session.id(), "force-closing session");
            session.force_close();
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.sessions.is_empty().await {
            if tokio::time::Instant::now() >= deadline {
                warn!("sessions still closing at shutdown deadline");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Stable session id for a (channel, thread) pair.
pub fn session_id(channel: &str, thread: &str) -> String {
    sanitize_id(&format!("{channel}_{thread}"))
}

#[derive(Debug)]
enum TriggerError {
    NoScript,
    Unknown(String),
    Setup(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_stable_and_sanitized() {
        assert_eq!(session_id("C1", ""), "C1_");
        assert_eq!(session_id("C1", "1629.456"), "C1_1629_456");
        assert_eq!(session_id("C1", "t"), session_id("C1", "t"));
    }
}
