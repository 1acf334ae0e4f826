use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::net::TcpListener;

/// Length of the random token used for multiplexer session names.
pub const TOKEN_LEN: usize = 10;

pub fn random_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Collapses anything outside `[A-Za-z0-9]` to `_` so channel/thread pairs
/// become stable session ids and safe multiplexer target names.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Asks the kernel for a free ephemeral port on the loopback interface.
///
/// The listener is dropped before returning, so the port is only *probably*
/// free by the time the caller binds it; callers that lose the race surface
/// a bind error and the session fails to start.
pub async fn random_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_alphanumeric_and_sized() {
        let token = random_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn sanitize_replaces_punctuation() {
        assert_eq!(sanitize_id("C123_1629.456"), "C123_1629_456");
        assert_eq!(sanitize_id("plain"), "plain");
        assert_eq!(sanitize_id(""), "");
    }

    #[tokio::test]
    async fn random_port_is_ephemeral() {
        let port = random_port().await.expect("allocate port");
        assert!(port > 1024);
    }
}
