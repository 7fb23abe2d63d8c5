use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::buttons::ButtonAction;

/// One button entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonEntry {
    /// Template image file name, resolved against the assets directory.
    pub image: String,
    pub action: ButtonAction,
    #[serde(default)]
    pub description: String,
    /// Alternate names dynamic sources may use for this button.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Overrides the class inferred from the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_class: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds between scan ticks.
    pub check_interval: f64,
    /// Seconds to wait between detection and injection.
    pub action_delay: f64,
    /// Per-button seconds during which a repeat detection is suppressed.
    pub cooldown: f64,
    /// Minimum match score, inclusive.
    pub confidence: f32,
    pub log_actions: bool,
    pub sound_alert_on_skip: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval: 0.5,
            action_delay: 0.3,
            cooldown: 2.0,
            confidence: 0.8,
            log_actions: true,
            sound_alert_on_skip: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowListConfig {
    /// Plain-text token file, one entry per line (commas also split).
    pub path: String,
    /// Seconds a read stays fresh before the file is consulted again.
    pub refresh_interval: f64,
}

impl Default for AllowListConfig {
    fn default() -> Self {
        Self {
            path: "allow_list.txt".into(),
            refresh_interval: 2.0,
        }
    }
}

/// Which dynamic source wins when both have fresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePrecedence {
    ChatFirst,
    FileFirst,
}

impl SourcePrecedence {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePrecedence::ChatFirst => "chat_first",
            SourcePrecedence::FileFirst => "file_first",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatInputConfig {
    pub enabled: bool,
    /// Substring matched against window titles, case-insensitive.
    pub window_title: String,
    pub refresh_interval: f64,
    /// When false, an empty or stale chat list answers nothing instead of
    /// falling back to configured defaults.
    pub fallback_to_config: bool,
    pub precedence: SourcePrecedence,
}

impl Default for ChatInputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_title: "Agent Manager".into(),
            refresh_interval: 2.0,
            fallback_to_config: true,
            precedence: SourcePrecedence::ChatFirst,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeyConfig {
    pub approve: String,
    pub deny: String,
    pub quit: String,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            approve: "ctrl+shift+y".into(),
            deny: "ctrl+shift+n".into(),
            quit: "ctrl+shift+q".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub buttons: BTreeMap<String, ButtonEntry>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub allow_list: AllowListConfig,
    #[serde(default)]
    pub chat_input_mode: ChatInputConfig,
    #[serde(default)]
    pub hotkeys: HotkeyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buttons: default_buttons(),
            settings: Settings::default(),
            allow_list: AllowListConfig::default(),
            chat_input_mode: ChatInputConfig::default(),
            hotkeys: HotkeyConfig::default(),
        }
    }
}

fn default_buttons() -> BTreeMap<String, ButtonEntry> {
    fn entry(image: &str, action: ButtonAction, description: &str, aliases: &[&str]) -> ButtonEntry {
        ButtonEntry {
            image: image.into(),
            action,
            description: description.into(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            deny_class: None,
        }
    }

    let mut buttons = BTreeMap::new();
    buttons.insert(
        "confirm".into(),
        entry("confirm.png", ButtonAction::Approve, "Confirm dialog button", &[]),
    );
    buttons.insert(
        "accept".into(),
        entry("accept.png", ButtonAction::Skip, "Accept dialog button", &["alt+enter"]),
    );
    buttons.insert(
        "deny".into(),
        entry("deny.png", ButtonAction::Skip, "Deny dialog button", &["escape", "esc"]),
    );
    buttons.insert(
        "reject".into(),
        entry("reject.png", ButtonAction::Skip, "Reject dialog button", &[]),
    );
    buttons.insert(
        "deny_confirm_combo".into(),
        entry(
            "deny_confirm.png",
            ButtonAction::Approve,
            "Dialog showing Deny and Confirm together",
            &[],
        ),
    );
    buttons.insert(
        "accept_reject_combo".into(),
        entry(
            "accept_reject.png",
            ButtonAction::Skip,
            "Dialog showing Accept and Reject together",
            &[],
        ),
    );
    buttons
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.buttons.is_empty() {
            bail!("no buttons configured");
        }
        for (id, entry) in &self.buttons {
            if id.trim().is_empty() {
                bail!("button with empty id");
            }
            if entry.image.trim().is_empty() {
                bail!("button [{id}] has no template image");
            }
        }

        let s = &self.settings;
        if !s.check_interval.is_finite() || s.check_interval <= 0.0 {
            bail!("check_interval must be positive, got {}", s.check_interval);
        }
        if !s.action_delay.is_finite() || s.action_delay < 0.0 {
            bail!("action_delay must not be negative, got {}", s.action_delay);
        }
        if !s.cooldown.is_finite() || s.cooldown < 0.0 {
            bail!("cooldown must not be negative, got {}", s.cooldown);
        }
        if !(0.0..=1.0).contains(&s.confidence) {
            bail!("confidence must be within 0.0..=1.0, got {}", s.confidence);
        }

        if !self.allow_list.refresh_interval.is_finite() || self.allow_list.refresh_interval <= 0.0 {
            bail!(
                "allow_list.refresh_interval must be positive, got {}",
                self.allow_list.refresh_interval
            );
        }
        let chat = &self.chat_input_mode;
        if !chat.refresh_interval.is_finite() || chat.refresh_interval <= 0.0 {
            bail!(
                "chat_input_mode.refresh_interval must be positive, got {}",
                chat.refresh_interval
            );
        }
        if chat.enabled && chat.window_title.trim().is_empty() {
            bail!("chat_input_mode.window_title must not be empty");
        }

        Ok(())
    }
}

/// Disk-backed configuration with an in-memory snapshot.
///
/// A malformed file is fatal when opening; once running, a reload that fails
/// to parse keeps the previous snapshot so a half-saved edit cannot take the
/// watcher down.
pub struct ConfigStore {
    path: PathBuf,
    assets_dir: PathBuf,
    data: RwLock<Config>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Loads the config, writing the defaults first if the file is missing.
    pub fn open(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str::<Config>(&contents)
                .with_context(|| format!("malformed config at {}", path.display()))?
        } else {
            let config = Config::default();
            let serialized = serde_json::to_string_pretty(&config)?;
            fs::write(path, serialized)
                .with_context(|| format!("failed to write default config to {}", path.display()))?;
            info!("created default config at {}", path.display());
            config
        };
        config.validate()?;

        let assets_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
            .join("assets");
        fs::create_dir_all(&assets_dir)
            .with_context(|| format!("failed to create assets dir {}", assets_dir.display()))?;

        let last_modified = file_mtime(path);
        Ok(Self {
            path: path.to_path_buf(),
            assets_dir,
            data: RwLock::new(config),
            last_modified: Mutex::new(last_modified),
        })
    }

    /// Current snapshot.
    pub fn config(&self) -> Config {
        self.data.read().unwrap().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    /// Applies a mutation, validates the result and persists it. The
    /// in-memory snapshot only moves when both succeed.
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.data.write().unwrap();
        let mut next = guard.clone();
        mutate(&mut next);
        next.validate()?;

        let serialized = serde_json::to_string_pretty(&next)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write config to {}", self.path.display()))?;
        *guard = next;
        *self.last_modified.lock().unwrap() = file_mtime(&self.path);
        Ok(())
    }

    /// Rereads the file when its mtime moved since the last look. Returns
    /// true when a new snapshot was installed. The mtime stamp advances even
    /// when parsing fails, so a broken edit is reported once, not every tick.
    pub fn reload_if_modified(&self) -> Result<bool> {
        let modified = file_mtime(&self.path);
        {
            let mut guard = self.last_modified.lock().unwrap();
            if modified == *guard {
                return Ok(false);
            }
            *guard = modified;
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read config from {}", self.path.display()))?;
        let config = serde_json::from_str::<Config>(&contents)
            .with_context(|| format!("malformed config at {}", self.path.display()))?;
        config.validate()?;

        *self.data.write().unwrap() = config;
        Ok(true)
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
