//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. ca-gateway.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。
//!
//! Sync frequency and calendar selection are only *seeds*: when present they
//! are written to the persisted sync state at startup, otherwise the
//! persisted values are used.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::store::SyncFrequency;
use crate::{Error, Result};

/// Default config file name
pub const CONFIG_FILE: &str = "ca-gateway.toml";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Local calendar directory
    #[serde(default)]
    pub local: LocalConfig,

    /// Remote CalDAV account
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sync interval; `None` keeps the persisted value
    pub frequency: Option<SyncFrequency>,

    /// Calendars to read from the local directory; `None` keeps the persisted value
    pub calendars: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory containing one subdirectory of `.ics` files per calendar
    #[serde(default = "default_ics_dir")]
    pub ics_dir: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            ics_dir: default_ics_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// CalDAV server URL
    pub server_url: Option<String>,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Calendar path on the server (defaults to the primary calendar)
    pub calendar_id: Option<String>,
}

impl RemoteConfig {
    /// Whether enough is configured to open a session
    pub fn is_configured(&self) -> bool {
        self.server_url.as_deref().is_some_and(|s| !s.is_empty())
            && self.username.as_deref().is_some_and(|s| !s.is_empty())
    }
}

fn default_db_path() -> String {
    "data/ca-gateway.db".to_string()
}

fn default_ics_dir() -> String {
    "calendars".to_string()
}

fn parse_frequency(raw: &str) -> Result<SyncFrequency> {
    let minutes: u32 = raw
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid sync frequency: {}", raw)))?;
    SyncFrequency::try_from(minutes)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// 設定ファイル内の `${VAR_NAME}` は環境変数の値に置換され、
    /// その後、環境変数による上書きが適用されます。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_toml_str(&toml_content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse TOML content (after `${VAR}` expansion), without env overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let toml: TomlConfig = toml::from_str(&expanded)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;
        Self::from_toml_config(toml)
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// `./ca-gateway.toml` が存在すればそれを使い、なければ環境変数のみを使います。
    pub fn load() -> Result<Self> {
        if Path::new(CONFIG_FILE).exists() {
            return Self::from_toml_file(CONFIG_FILE);
        }

        Self::from_env()
    }

    /// Load configuration from environment variables over defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_toml_config(toml: TomlConfig) -> Result<Self> {
        let store = toml.store.unwrap_or_default();
        let sync = toml.sync.unwrap_or_default();
        let local = toml.local.unwrap_or_default();
        let remote = toml.remote.unwrap_or_default();

        let frequency = sync.frequency_minutes.map(SyncFrequency::try_from).transpose()?;

        Ok(Config {
            store: StoreConfig {
                db_path: store.db_path.unwrap_or_else(default_db_path),
            },
            sync: SyncConfig {
                frequency,
                calendars: sync.calendars,
            },
            local: LocalConfig {
                ics_dir: local.ics_dir.unwrap_or_else(default_ics_dir),
            },
            remote: RemoteConfig {
                server_url: remote.server_url,
                username: remote.username,
                password: remote.password,
                calendar_id: remote.calendar_id,
            },
        })
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CA_DB_PATH") {
            if !path.is_empty() {
                self.store.db_path = path;
            }
        }

        if let Ok(raw) = std::env::var("CA_SYNC_FREQUENCY") {
            if !raw.is_empty() {
                self.sync.frequency = Some(parse_frequency(&raw)?);
            }
        }
        if let Ok(raw) = std::env::var("CA_CALENDARS") {
            self.sync.calendars = Some(split_list(&raw));
        }

        if let Ok(dir) = std::env::var("CA_ICS_DIR") {
            if !dir.is_empty() {
                self.local.ics_dir = dir;
            }
        }

        if let Ok(url) = std::env::var("CALDAV_URL") {
            self.remote.server_url = Some(url);
        }
        if let Ok(username) = std::env::var("CALDAV_USERNAME") {
            self.remote.username = Some(username);
        }
        if let Ok(password) = std::env::var("CALDAV_PASSWORD") {
            self.remote.password = Some(password);
        }
        if let Ok(calendar) = std::env::var("CALDAV_CALENDAR") {
            self.remote.calendar_id = Some(calendar);
        }

        Ok(())
    }
}

// ============================================================================
// TOML 構造体定義（ファイル解析用）
// ============================================================================

/// TOML ファイル用のトップレベル構造
#[derive(Debug, Deserialize)]
struct TomlConfig {
    /// データベース設定
    store: Option<TomlStoreConfig>,
    /// 同期設定
    sync: Option<TomlSyncConfig>,
    /// ローカルカレンダー設定
    local: Option<TomlLocalConfig>,
    /// CalDAV 設定
    remote: Option<TomlRemoteConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlStoreConfig {
    /// データベースパス
    #[serde(default)]
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlSyncConfig {
    /// 同期間隔（分）
    #[serde(default)]
    frequency_minutes: Option<u32>,
    /// 対象カレンダー ID リスト
    #[serde(default)]
    calendars: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLocalConfig {
    /// .ics ディレクトリ
    #[serde(default)]
    ics_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlRemoteConfig {
    server_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    calendar_id: Option<String>,
}
