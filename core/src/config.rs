use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;

/// How often the output renderer captures and (if needed) re-posts the
/// terminal screen.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(300);
/// Idle time after which the session owner is warned once.
pub const DEFAULT_IDLE_WARN_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Idle time after which the session is closed.
pub const DEFAULT_IDLE_KILL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Slack,
    Discord,
}

/// Where the user types commands relative to where the screen is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Channel,
    Thread,
    Split,
}

impl ControlMode {
    pub fn from_keyword(token: &str) -> Option<Self> {
        match token {
            "channel" => Some(Self::Channel),
            "thread" => Some(Self::Thread),
            "split" => Some(Self::Split),
            _ => None,
        }
    }
}

/// Whether rendered screens keep the full row count or drop trailing blanks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    Full,
    Trim,
}

impl WindowMode {
    pub fn from_keyword(token: &str) -> Option<Self> {
        match token {
            "full" => Some(Self::Full),
            "trim" => Some(Self::Trim),
            _ => None,
        }
    }
}

/// Who may feed input into a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    OnlyMe,
    Everyone,
}

impl AuthMode {
    pub fn from_keyword(token: &str) -> Option<Self> {
        match token {
            "only-me" => Some(Self::OnlyMe),
            "everyone" => Some(Self::Everyone),
            _ => None,
        }
    }
}

/// Fixed terminal geometries. The row/column pairs are authoritative; chat
/// rendering and the multiplexer window both use them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalSize {
    Tiny,
    Small,
    Medium,
    Large,
}

impl TerminalSize {
    pub fn from_keyword(token: &str) -> Option<Self> {
        match token {
            "tiny" => Some(Self::Tiny),
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    pub fn rows(self) -> u16 {
        match self {
            Self::Tiny => 15,
            Self::Small => 20,
            Self::Medium => 30,
            Self::Large => 40,
        }
    }

    pub fn cols(self) -> u16 {
        match self {
            Self::Tiny => 60,
            Self::Small => 80,
            Self::Medium => 100,
            Self::Large => 120,
        }
    }
}

/// Global bot configuration. Per-session settings start from these defaults
/// and are overridden by trigger-message keywords.
#[derive(Debug, Clone)]
pub struct Config {
    pub platform: Platform,
    pub script_dir: PathBuf,
    pub default_control_mode: ControlMode,
    pub default_window_mode: WindowMode,
    pub default_auth_mode: AuthMode,
    pub default_size: TerminalSize,
    pub refresh_interval: Duration,
    pub idle_warn_timeout: Duration,
    pub idle_kill_timeout: Duration,
    /// `host:port` the share SSH server listens on and advertises to remote
    /// users. `None` disables terminal sharing.
    pub share_host: Option<String>,
}

impl Config {
    pub fn new(platform: Platform, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            script_dir: script_dir.into(),
            default_control_mode: ControlMode::Channel,
            default_window_mode: WindowMode::Full,
            default_auth_mode: AuthMode::Everyone,
            default_size: TerminalSize::Small,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            idle_warn_timeout: DEFAULT_IDLE_WARN_TIMEOUT,
            idle_kill_timeout: DEFAULT_IDLE_KILL_TIMEOUT,
            share_host: None,
        }
    }

    pub fn share_enabled(&self) -> bool {
        self.share_host.is_some()
    }

    /// Script aliases in stable order. Every plain file in the script dir is
    /// one launchable script; the file name is the alias.
    pub fn scripts(&self) -> Vec<String> {
        self.script_catalog()
            .map(|catalog| catalog.into_keys().collect())
            .unwrap_or_default()
    }

    /// Resolves a script alias to its path, or `None` for unknown aliases.
    pub fn script(&self, name: &str) -> Option<PathBuf> {
        self.script_catalog()
            .ok()
            .and_then(|mut catalog| catalog.remove(name))
    }

    fn script_catalog(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut catalog = BTreeMap::new();
        let entries = std::fs::read_dir(&self.script_dir).map_err(|err| {
            Error::config(format!(
                "cannot read script dir {}: {err}",
                self.script_dir.display()
            ))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            catalog.insert(name.to_string(), path);
        }
        Ok(catalog)
    }

    /// The TCP port of `share_host`, once share mode is enabled.
    pub fn share_port(&self) -> Result<u16> {
        let host = self
            .share_host
            .as_deref()
            .ok_or_else(|| Error::config("share mode is not enabled"))?;
        let (_, port) = host
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("share host {host} is missing a port")))?;
        port.parse()
            .map_err(|_| Error::config(format!("share host {host} has an invalid port")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_authoritative() {
        assert_eq!(
            (TerminalSize::Tiny.rows(), TerminalSize::Tiny.cols()),
            (15, 60)
        );
        assert_eq!(
            (TerminalSize::Small.rows(), TerminalSize::Small.cols()),
            (20, 80)
        );
        assert_eq!(
            (TerminalSize::Medium.rows(), TerminalSize::Medium.cols()),
            (30, 100)
        );
        assert_eq!(
            (TerminalSize::Large.rows(), TerminalSize::Large.cols()),
            (40, 120)
        );
    }

    #[test]
    fn keywords_round_trip() {
        for size in [
            TerminalSize::Tiny,
            TerminalSize::Small,
            TerminalSize::Medium,
            TerminalSize::Large,
        ] {
            assert_eq!(TerminalSize::from_keyword(size.keyword()), Some(size));
        }
        assert_eq!(TerminalSize::from_keyword("huge"), None);
        assert_eq!(AuthMode::from_keyword("only-me"), Some(AuthMode::OnlyMe));
        assert_eq!(ControlMode::from_keyword("split"), Some(ControlMode::Split));
        assert_eq!(WindowMode::from_keyword("trim"), Some(WindowMode::Trim));
    }

    #[test]
    fn script_catalog_lists_plain_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("bash"), "#!/bin/sh\nexec bash\n").unwrap();
        std::fs::write(dir.path().join("python"), "#!/bin/sh\nexec python3\n").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let config = Config::new(Platform::Slack, dir.path());
        assert_eq!(config.scripts(), vec!["bash", "python"]);
        assert!(config.script("bash").is_some());
        assert!(config.script(".hidden").is_none());
        assert!(config.script("zsh").is_none());
    }

    #[test]
    fn share_port_parses_host() {
        let mut config = Config::new(Platform::Slack, "/tmp");
        assert!(config.share_port().is_err());
        config.share_host = Some("repl.example.com:2222".to_string());
        assert_eq!(config.share_port().unwrap(), 2222);
    }
}
