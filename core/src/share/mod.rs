use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::Channel;
use russh::ChannelId;
use russh::CryptoVec;
use russh::Disconnect;
use russh::Pty;
use russh::keys::Algorithm;
use russh::keys::PrivateKey;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::server::Auth;
use russh::server::Config as SshConfig;
use russh::server::Handle;
use russh::server::Handler;
use russh::server::Msg;
use russh::server::Server;
use russh::server::Session as SshSession;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bot::SessionRegistry;
use crate::errors::Error;
use crate::errors::Result;
use crate::session::Session;

/// Stub script launched inside the multiplexer for share sessions; it is the
/// local end of the bridge.
const RELAY_SCRIPT: &str = include_str!("relay.sh");

pub(crate) fn relay_script_path() -> PathBuf {
    std::env::temp_dir().join("termbridge_relay.sh")
}

/// Writes the relay stub to disk once at startup, owner-executable only.
pub(crate) async fn write_relay_script() -> Result<()> {
    let path = relay_script_path();
    tokio::fs::write(&path, RELAY_SCRIPT).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// The command a share session runs in its terminal.
pub(crate) fn relay_command(session_id: &str, share_host: &str, relay_port: u16) -> String {
    format!(
        "sh {} '{session_id}' '{share_host}' {relay_port}",
        relay_script_path().display()
    )
}

/// SSH server for terminal sharing.
///
/// Remote users authenticate with a user name equal to an active share
/// session id (no password, no key) and request exactly one reverse forward
/// of `localhost:<relayPort>`. The server then listens on that port locally;
/// the session's relay stub connects to it and its bytes tunnel through to
/// the remote terminal. PTY allocation is refused, the server is a bridge,
/// not a shell.
pub struct ShareServer {
    sessions: SessionRegistry,
    listen_port: u16,
}

impl ShareServer {
    pub fn new(sessions: SessionRegistry, listen_port: u16) -> Self {
        Self {
            sessions,
            listen_port,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|err| Error::share(format!("cannot generate host key: {err}")))?;
        let config = Arc::new(SshConfig {
            keys: vec![key],
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        let mut listener = ShareListener {
            sessions: self.sessions,
        };
        info!(port = self.listen_port, "share server listening");
        tokio::select! {
            result = listener.run_on_address(config, ("0.0.0.0", self.listen_port)) => {
                result.map_err(|err| Error::share(err.to_string()))
            }
            _ = cancel.cancelled() => Ok(()),
        }
    }
}

struct ShareListener {
    sessions: SessionRegistry,
}

impl Server for ShareListener {
    type Handler = ShareHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> ShareHandler {
        debug!(?peer, "share client connected");
        ShareHandler {
            sessions: self.sessions.clone(),
            session: None,
            forwarded: false,
        }
    }
}

/// Per-connection handler. `session` is resolved at auth time and pins the
/// chat session this connection may bridge into.
struct ShareHandler {
    sessions: SessionRegistry,
    session: Option<Arc<Session>>,
    forwarded: bool,
}

impl Handler for ShareHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        match self.sessions.get_active(user).await {
            Some(session) if session.relay_port().is_some() => {
                info!(session = %session.id(), "share connection authenticated");
                self.session = Some(session);
                Ok(Auth::Accept)
            }
            _ => {
                debug!(user, "rejecting share connection for unknown session");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    /// Sessions are bridges, not shells.
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut SshSession,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_success(channel)?;
        if let Some(chat_session) = &self.session {
            let text = handoff_text(chat_session);
            session.data(channel, CryptoVec::from(text.into_bytes()))?;
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut SshSession,
    ) -> std::result::Result<bool, Self::Error> {
        // An invalid forward request drops the whole connection, not just
        // the request: a client probing other targets gets no second try.
        let Some(chat_session) = self.session.clone() else {
            reject_connection(session)?;
            return Ok(false);
        };
        if !forward_allowed(&chat_session, self.forwarded, address, *port) {
            info!(
                session = %chat_session.id(),
                address,
                port = *port,
                "rejecting reverse forward, closing connection"
            );
            reject_connection(session)?;
            return Ok(false);
        }
        let relay_port = chat_session.relay_port().expect("share session has a port");

        let listener = match TcpListener::bind(("127.0.0.1", relay_port)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(session = %chat_session.id(), "cannot bind relay port: {err}");
                reject_connection(session)?;
                return Ok(false);
            }
        };
        self.forwarded = true;
        info!(session = %chat_session.id(), port = relay_port, "reverse forward granted");

        let handle = session.handle();
        let cancel = chat_session.closing_token();
        let address = address.to_string();
        let forward_port = *port;
        tokio::spawn(bridge_loop(listener, handle, cancel, address, forward_port));
        Ok(true)
    }
}

/// Accepts local relay connections and tunnels each over a forwarded-tcpip
/// channel. Ends when the chat session closes or the SSH side goes away;
/// the relay stub then loses its socket, exits, and takes the terminal (and
/// with it the session) down.
async fn bridge_loop(
    listener: TcpListener,
    handle: Handle,
    cancel: CancellationToken,
    address: String,
    port: u32,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { break };
                match handle
                    .channel_open_forwarded_tcpip(
                        address.clone(),
                        port,
                        "127.0.0.1".to_string(),
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => {
                        tokio::spawn(pipe(stream, channel, cancel.clone()));
                    }
                    Err(err) => {
                        debug!("ssh side closed, ending bridge: {err}");
                        break;
                    }
                }
            }
        }
    }
}

async fn pipe(mut stream: TcpStream, channel: Channel<Msg>, cancel: CancellationToken) {
    let mut channel_stream = channel.into_stream();
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream) => {
            if let Err(err) = result {
                debug!("bridge connection ended: {err}");
            }
        }
    }
}

fn reject_connection(session: &mut SshSession) -> std::result::Result<(), russh::Error> {
    session.disconnect(Disconnect::ByApplication, "forward rejected", "")
}

/// One forward per session, loopback only, exact relay-port match, session
/// still alive.
fn forward_allowed(session: &Session, already_forwarded: bool, address: &str, port: u32) -> bool {
    let Some(relay_port) = session.relay_port() else {
        return false;
    };
    !already_forwarded
        && session.active()
        && (address == "localhost" || address == "127.0.0.1")
        && port == u32::from(relay_port)
}

fn handoff_text(session: &Session) -> String {
    let port = session.relay_port().unwrap_or_default();
    format!(
        "This connection bridges a terminal into chat session {}.\r\n\
         Keep it open and make sure it carries a reverse forward of \
         localhost:{port}; interactive use is disabled.\r\n",
        session.id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::chat::MemConn;
    use crate::config::AuthMode;
    use crate::config::Config;
    use crate::config::ControlMode;
    use crate::config::Platform;
    use crate::config::TerminalSize;
    use crate::config::WindowMode;
    use crate::chat::ChatTarget;
    use crate::errors::CloseReason;
    use crate::errors::Result;
    use crate::session::SessionConfig;
    use crate::terminal::TerminalDriver;

    struct NullTerminal;

    #[async_trait]
    impl TerminalDriver for NullTerminal {
        async fn start(&self, _size: TerminalSize, _command: &str) -> Result<()> {
            Ok(())
        }
        async fn active(&self) -> bool {
            true
        }
        async fn paste(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn send_keys(&self, _raw: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn hardcopy(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn share_session(relay_port: Option<u16>) -> Arc<Session> {
        let config = SessionConfig {
            id: "C1_t1".to_string(),
            owner: "U1".to_string(),
            command: "sh /tmp/relay.sh".to_string(),
            control_mode: ControlMode::Thread,
            window_mode: WindowMode::Trim,
            auth_mode: AuthMode::OnlyMe,
            size: TerminalSize::Tiny,
            control: ChatTarget::new("C1", "t1"),
            terminal: ChatTarget::new("C1", "t1"),
            relay_port,
        };
        Session::new(
            config,
            Arc::new(Config::new(Platform::Slack, "/tmp")),
            Arc::new(MemConn::new()),
            Arc::new(NullTerminal),
        )
    }

    #[test]
    fn forward_requires_exact_loopback_target() {
        let session = share_session(Some(40123));
        assert!(forward_allowed(&session, false, "localhost", 40123));
        assert!(forward_allowed(&session, false, "127.0.0.1", 40123));
        assert!(!forward_allowed(&session, false, "localhost", 40124));
        assert!(!forward_allowed(&session, false, "0.0.0.0", 40123));
        assert!(!forward_allowed(&session, false, "example.com", 40123));
        assert!(!forward_allowed(&session, true, "localhost", 40123));
    }

    #[test]
    fn forward_rejected_without_relay_port_or_after_close() {
        let plain = share_session(None);
        assert!(!forward_allowed(&plain, false, "localhost", 40123));

        let closing = share_session(Some(40123));
        closing.request_close(CloseReason::UserExit);
        assert!(!forward_allowed(&closing, false, "localhost", 40123));
    }

    #[test]
    fn relay_command_quotes_its_arguments() {
        let command = relay_command("C1_t1", "repl.example.com:2222", 40123);
        assert!(command.contains("'C1_t1'"));
        assert!(command.contains("'repl.example.com:2222'"));
        assert!(command.ends_with("40123"));
        assert!(command.starts_with("sh "));
    }

    #[test]
    fn relay_script_waits_before_bridging() {
        assert!(RELAY_SCRIPT.contains("ssh -p"));
        assert!(RELAY_SCRIPT.contains("nc -z 127.0.0.1"));
    }
}
