use std::path::Path;
use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use super::TerminalDriver;
use crate::config::TerminalSize;
use crate::errors::Error;
use crate::errors::Result;
use crate::util::random_token;

const TMUX: &str = "tmux";

/// Verifies the multiplexer binary is present and runnable. Called once at
/// bot startup so a missing binary is a config error, not a per-session one.
pub async fn preflight() -> Result<()> {
    let output = Command::new(TMUX)
        .arg("-V")
        .output()
        .await
        .map_err(|err| Error::config(format!("tmux check failed: {err}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::config(format!(
            "tmux check failed:{}",
            format_output(&output)
        )))
    }
}

/// Drives one detached tmux session. Each live driver maps to exactly one
/// tmux session plus four private temp files (config, capture, paste buffer,
/// log), all removed by `stop`.
pub struct TmuxDriver {
    name: String,
    conf_file: PathBuf,
    capture_file: PathBuf,
    buffer_file: PathBuf,
    log_file: PathBuf,
}

impl TmuxDriver {
    pub fn new() -> Self {
        let name = format!("tb_{}", random_token());
        let tmp = std::env::temp_dir();
        let shm = shm_dir();
        Self {
            conf_file: tmp.join(format!("{name}.conf")),
            capture_file: shm.join(format!("{name}.capture")),
            buffer_file: shm.join(format!("{name}.buffer")),
            log_file: tmp.join(format!("{name}.log")),
            name,
        }
    }

    pub fn session_name(&self) -> &str {
        &self.name
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    async fn tmux(&self, args: &[&str]) -> std::io::Result<Output> {
        debug!(session = %self.name, ?args, "tmux");
        Command::new(TMUX).args(args).output().await
    }

    async fn tmux_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self
            .tmux(args)
            .await
            .map_err(|err| Error::terminal_command(format!("cannot run tmux: {err}")))?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::terminal_command(format!(
                "tmux {} failed:{}",
                args.first().copied().unwrap_or_default(),
                format_output(&output)
            )))
        }
    }
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalDriver for TmuxDriver {
    async fn start(&self, size: TerminalSize, command: &str) -> Result<()> {
        tokio::fs::write(&self.conf_file, "set -g status off\nset -g history-limit 10000\n")
            .await
            .map_err(Error::terminal_start)?;
        tokio::fs::write(&self.log_file, b"")
            .await
            .map_err(Error::terminal_start)?;

        let cols = size.cols().to_string();
        let rows = size.rows().to_string();
        let conf = self.conf_file.display().to_string();
        let output = self
            .tmux(&[
                "-f",
                &conf,
                "new-session",
                "-d",
                "-s",
                &self.name,
                "-x",
                &cols,
                "-y",
                &rows,
                command,
            ])
            .await
            .map_err(Error::terminal_start)?;
        if !output.status.success() {
            return Err(Error::terminal_start(std::io::Error::other(format!(
                "tmux new-session failed:{}",
                format_output(&output)
            ))));
        }

        // Mirror everything the pane prints into the private log file.
        let pipe = format!("cat >> {}", self.log_file.display());
        self.tmux_checked(&["pipe-pane", "-t", &self.name, "-o", &pipe])
            .await?;
        Ok(())
    }

    async fn active(&self) -> bool {
        self.tmux(&["has-session", "-t", &self.name])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn paste(&self, text: &str) -> Result<()> {
        tokio::fs::write(&self.buffer_file, text).await?;
        let file = self.buffer_file.display().to_string();
        self.tmux_checked(&["load-buffer", "-b", &self.name, &file])
            .await?;
        self.tmux_checked(&["paste-buffer", "-b", &self.name, "-t", &self.name, "-d"])
            .await?;
        Ok(())
    }

    async fn send_keys(&self, raw: &[u8]) -> Result<()> {
        let mut args = vec![
            "send-keys".to_string(),
            "-t".to_string(),
            self.name.clone(),
            "-H".to_string(),
        ];
        args.extend(raw.iter().map(|byte| format!("{byte:02x}")));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.tmux_checked(&arg_refs).await?;
        Ok(())
    }

    async fn hardcopy(&self) -> Result<String> {
        let buffer = format!("{}_cap", self.name);
        self.tmux_checked(&["capture-pane", "-t", &self.name, "-b", &buffer])
            .await?;
        let file = self.capture_file.display().to_string();
        self.tmux_checked(&["save-buffer", "-b", &buffer, &file])
            .await?;
        if let Err(err) = self.tmux(&["delete-buffer", "-b", &buffer]).await {
            warn!(session = %self.name, "cannot delete capture buffer: {err}");
        }
        Ok(tokio::fs::read_to_string(&self.capture_file).await?)
    }

    async fn stop(&self) -> Result<()> {
        if self.active().await {
            if let Err(err) = self.tmux_checked(&["kill-session", "-t", &self.name]).await {
                warn!(session = %self.name, "cannot kill tmux session: {err}");
            }
        }
        for file in [
            &self.conf_file,
            &self.capture_file,
            &self.buffer_file,
            &self.log_file,
        ] {
            let _ = tokio::fs::remove_file(file).await;
        }
        Ok(())
    }
}

fn shm_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn format_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut parts = Vec::new();
    if !stdout.trim().is_empty() {
        parts.push(stdout.trim().to_string());
    }
    if !stderr.trim().is_empty() {
        parts.push(stderr.trim().to_string());
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" {}", parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_files_are_private_to_the_session() {
        let a = TmuxDriver::new();
        let b = TmuxDriver::new();
        assert_ne!(a.session_name(), b.session_name());
        assert_ne!(a.conf_file, b.conf_file);
        assert_ne!(a.log_file, b.log_file);
        assert!(a.session_name().starts_with("tb_"));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let driver = TmuxDriver::new();
        driver.stop().await.expect("stop is idempotent");
        driver.stop().await.expect("stop twice is fine");
        assert!(!driver.conf_file.exists());
    }
}
