mod input;
mod renderer;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::chat::ChatConn;
use crate::chat::ChatTarget;
use crate::config::AuthMode;
use crate::config::Config;
use crate::config::ControlMode;
use crate::config::TerminalSize;
use crate::config::WindowMode;
use crate::errors::CloseReason;
use crate::errors::Result;
use crate::terminal::TerminalDriver;

const INPUT_BUFFER: usize = 32;
const LIVENESS_INTERVAL: Duration = Duration::from_secs(2);
const MAX_IDLE_WATCH_INTERVAL: Duration = Duration::from_secs(1);

const STARTED_MESSAGE: &str =
    "Session started! Type `!help` for commands, `!exit` to end the session.";

/// Everything a single session needs to run, assembled by the dispatcher
/// from the trigger message and global defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: String,
    pub owner: String,
    /// Shell command launched inside the multiplexer.
    pub command: String,
    pub control_mode: ControlMode,
    pub window_mode: WindowMode,
    pub auth_mode: AuthMode,
    pub size: TerminalSize,
    /// Where commands are read.
    pub control: ChatTarget,
    /// Where the rendered screen is posted. Differs from `control` in split
    /// mode only.
    pub terminal: ChatTarget,
    /// Reverse-forward port for share sessions.
    pub relay_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct UserInput {
    pub user: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Starting,
    Running,
    Closing,
    Closed,
}

/// One chat-thread-to-terminal binding.
///
/// A running session owns a small set of concurrent tasks (input pump,
/// output pump, liveness watcher, idle watcher) that all select on one
/// cancellation token. Whichever task decides the session is over records a
/// close reason and cancels; `run` then joins the tasks, stops the terminal,
/// posts the final message and flips to `Closed`, after which nothing is
/// sent on its behalf again.
pub struct Session {
    config: SessionConfig,
    settings: Arc<Config>,
    conn: Arc<dyn ChatConn>,
    terminal: Arc<dyn TerminalDriver>,
    input_tx: mpsc::Sender<UserInput>,
    input_rx: Mutex<Option<mpsc::Receiver<UserInput>>>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    close_reason: Mutex<Option<CloseReason>>,
    warned_idle: AtomicBool,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        settings: Arc<Config>,
        conn: Arc<dyn ChatConn>,
        terminal: Arc<dyn TerminalDriver>,
    ) -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        Arc::new(Self {
            config,
            settings,
            conn,
            terminal,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Starting),
            last_activity: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            warned_idle: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    pub fn relay_port(&self) -> Option<u16> {
        self.config.relay_port
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state")
    }

    /// True while the session accepts input; forwarding stops once it starts
    /// closing.
    pub fn active(&self) -> bool {
        self.state() < SessionState::Closing
    }

    /// A token that fires when the session begins closing. Used by the share
    /// server to tie bridge lifetimes to the session.
    pub fn closing_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Enqueues one chat line. Lines are delivered to the input pump in
    /// arrival order; lines for a closing session are dropped.
    pub async fn user_input(&self, user: &str, text: &str) {
        if !self.active() {
            return;
        }
        let _ = self
            .input_tx
            .send(UserInput {
                user: user.to_string(),
                text: text.to_string(),
            })
            .await;
    }

    /// Requests a close from any task or from the dispatcher. The first
    /// reason recorded wins; subsequent calls only re-cancel, which is a
    /// no-op.
    pub fn request_close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock().expect("close reason");
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        {
            let mut state = self.state.lock().expect("session state");
            if *state < SessionState::Closing {
                *state = SessionState::Closing;
            }
        }
        self.cancel.cancel();
    }

    /// Dispatcher-initiated close (bot shutdown). Safe to call concurrently
    /// with a normal close; idempotent.
    pub fn force_close(&self) {
        self.request_close(CloseReason::Forced);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().expect("close reason")
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("session state") = next;
    }

    pub(crate) fn touch_activity(&self) {
        *self.last_activity.lock().expect("last activity") = Instant::now();
        self.warned_idle.store(false, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("last activity").elapsed()
    }

    /// Best-effort chat send. Transient failures are logged, never fatal,
    /// and nothing is sent once the session is closed.
    pub(crate) async fn say(&self, target: &ChatTarget, text: &str) {
        if self.state() == SessionState::Closed {
            return;
        }
        if let Err(err) = self.conn.send(target, text).await {
            warn!(session = %self.config.id, "cannot send message: {err}");
        }
    }

    /// Runs the session to completion: terminal start, concurrent tasks,
    /// teardown. The caller removes the session from the registry afterwards.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(session = %self.config.id, command = %self.config.command, "starting session");
        if let Err(err) = self
            .terminal
            .start(self.config.size, &self.config.command)
            .await
        {
            self.say(
                &self.config.control,
                &format!("Cannot start this session: {err}"),
            )
            .await;
            self.set_state(SessionState::Closed);
            // Start may have left temp files behind; stop cleans them up.
            let _ = self.terminal.stop().await;
            return Err(err);
        }
        self.say(&self.config.control, STARTED_MESSAGE).await;
        self.set_state(SessionState::Running);
        self.touch_activity();

        let tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(input_pump(Arc::clone(self))),
            tokio::spawn(renderer::run(Arc::clone(self))),
            tokio::spawn(liveness_watch(Arc::clone(self))),
            tokio::spawn(idle_watch(Arc::clone(self))),
        ];

        self.cancel.cancelled().await;
        self.set_state(SessionState::Closing);
        for task in tasks {
            let _ = task.await;
        }

        if let Err(err) = self.terminal.stop().await {
            warn!(session = %self.config.id, "terminal teardown: {err}");
        }
        let reason = self.close_reason().unwrap_or(CloseReason::Forced);
        self.say(&self.config.control, reason.message()).await;
        self.set_state(SessionState::Closed);
        info!(session = %self.config.id, ?reason, "session closed");
        Ok(())
    }
}

/// Receives chat lines and runs them through the input router.
async fn input_pump(session: Arc<Session>) {
    let rx = session.input_rx.lock().expect("input receiver").take();
    let Some(mut rx) = rx else {
        return;
    };
    debug!(session = %session.config.id, "input pump started");
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => input::route_line(&session, &line).await,
                None => break,
            },
        }
    }
    debug!(session = %session.config.id, "input pump exiting");
}

/// Polls the multiplexer; a vanished session means the program exited or the
/// multiplexer crashed, either way the session is over.
async fn liveness_watch(session: Arc<Session>) {
    debug!(session = %session.config.id, "liveness watcher started");
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = tokio::time::sleep(LIVENESS_INTERVAL) => {
                if !session.terminal.active().await {
                    info!(session = %session.config.id, "terminal died");
                    session.request_close(CloseReason::TerminalDied);
                    break;
                }
            }
        }
    }
    debug!(session = %session.config.id, "liveness watcher exiting");
}

/// Warns once at the soft idle timeout and closes at the hard one. Input and
/// visible screen changes both reset the clock.
async fn idle_watch(session: Arc<Session>) {
    let warn_after = session.settings.idle_warn_timeout;
    let kill_after = session.settings.idle_kill_timeout;
    // Tick fast enough that the warning window between the two timeouts is
    // never skipped over, even with sub-second test timeouts.
    let tick = (kill_after.saturating_sub(warn_after) / 2)
        .clamp(Duration::from_millis(10), MAX_IDLE_WATCH_INTERVAL);
    debug!(session = %session.config.id, "idle watcher started");
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {
                let idle = session.idle_for();
                if idle >= kill_after {
                    info!(session = %session.config.id, "idle timeout");
                    session.request_close(CloseReason::Idle);
                    break;
                }
                if idle >= warn_after
                    && !session.warned_idle.swap(true, Ordering::SeqCst)
                {
                    let remaining = kill_after.saturating_sub(idle);
                    session
                        .say(
                            &session.config.control,
                            &format!(
                                "Still there? This session closes after {}s more of inactivity.",
                                remaining.as_secs().max(1)
                            ),
                        )
                        .await;
                }
            }
        }
    }
    debug!(session = %session.config.id, "idle watcher exiting");
}
