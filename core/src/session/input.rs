use tracing::debug;
use tracing::warn;

use super::Session;
use super::UserInput;
use crate::config::AuthMode;
use crate::errors::CloseReason;

const HELP_TEXT: &str = "Available commands:\n\
    \x20 `!ret`, `!r` - Send an empty return\n\
    \x20 `!ctrl-c`, `!ctrl-d`, `!ctrl-l` - Send the control sequence\n\
    \x20 `!up`, `!down`, `!left`, `!right` - Send an arrow key\n\
    \x20 `!exit` - End this session\n\
    The `!` prefix is optional for the sequences above. \
    Lines starting with `#` are ignored.";

/// Translates one chat line into terminal input, in rule order:
/// authorization, comments, `!` meta-commands, bare control aliases, and
/// finally paste-with-newline.
pub(super) async fn route_line(session: &Session, input: &UserInput) {
    if session.config.auth_mode == AuthMode::OnlyMe && input.user != session.config.owner {
        // Dropped silently; a chat reply here would just be noise.
        debug!(session = %session.config.id, user = %input.user, "input not authorized");
        return;
    }
    session.touch_activity();

    let line = input.text.as_str();
    if line.starts_with('#') {
        return;
    }
    if let Some(command) = line.strip_prefix('!') {
        match command {
            "help" => {
                session.say(&session.config.control, HELP_TEXT).await;
                return;
            }
            "exit" => {
                session.request_close(CloseReason::UserExit);
                return;
            }
            other => {
                if let Some(bytes) = control_bytes(other) {
                    send_keys(session, bytes).await;
                    return;
                }
                // Not a known meta-command; falls through to a plain paste.
            }
        }
    } else if let Some(bytes) = control_bytes(line) {
        send_keys(session, bytes).await;
        return;
    }

    if let Err(err) = session.terminal.paste(&format!("{line}\n")).await {
        warn!(session = %session.config.id, "cannot paste input: {err}");
    }
}

async fn send_keys(session: &Session, bytes: &[u8]) {
    if let Err(err) = session.terminal.send_keys(bytes).await {
        warn!(session = %session.config.id, "cannot send keys: {err}");
    }
}

/// Control-byte alias table. `!`-prefixed and plain forms are equivalent.
fn control_bytes(alias: &str) -> Option<&'static [u8]> {
    match alias {
        "r" | "ret" => Some(b"\n"),
        "ctrl-c" => Some(&[0x03]),
        "ctrl-d" => Some(&[0x04]),
        "ctrl-l" => Some(&[0x0c]),
        "up" => Some(b"\x1b[A"),
        "down" => Some(b"\x1b[B"),
        "left" => Some(b"\x1b[D"),
        "right" => Some(b"\x1b[C"),
        _ => None,
    }
}
