use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::anyhow;
use image::GrayImage;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// What the watcher should do with a button once it shows up on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonAction {
    Approve,
    Deny,
    Skip,
}

impl ButtonAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ButtonAction::Approve => "approve",
            ButtonAction::Deny => "deny",
            ButtonAction::Skip => "skip",
        }
    }
}

impl FromStr for ButtonAction {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "approve" => Ok(ButtonAction::Approve),
            "deny" => Ok(ButtonAction::Deny),
            "skip" => Ok(ButtonAction::Skip),
            other => Err(anyhow!(
                "unknown action '{other}' (expected approve, deny or skip)"
            )),
        }
    }
}

/// Lowercases and strips all whitespace so "Alt + Enter" and "alt+enter"
/// compare equal.
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Class inferred from the id when the config does not say. Approve markers
/// win over deny markers, so "deny_confirm_combo" lands approve-class.
pub fn default_deny_class(id: &str) -> bool {
    const APPROVE_MARKERS: [&str; 2] = ["confirm", "accept"];
    const DENY_MARKERS: [&str; 3] = ["deny", "reject", "cancel"];

    let id = id.to_ascii_lowercase();
    if APPROVE_MARKERS.iter().any(|marker| id.contains(marker)) {
        return false;
    }
    DENY_MARKERS.iter().any(|marker| id.contains(marker))
}

/// One known button: its template pixels plus the policy attached to it.
#[derive(Debug, Clone)]
pub struct ButtonDefinition {
    pub id: String,
    pub image_path: PathBuf,
    /// None when the template image is missing or unreadable; the button
    /// stays configured but cannot be detected on screen.
    pub template: Option<GrayImage>,
    pub default_action: ButtonAction,
    pub deny_class: bool,
    /// Normalized alternate names a dynamic source may use for this button.
    pub aliases: Vec<String>,
    pub description: String,
}

/// All configured buttons with their templates decoded, in stable id order.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    buttons: Vec<ButtonDefinition>,
}

impl TemplateStore {
    /// Decodes every configured template. A missing image is a warning, not
    /// an error: the rest of the store stays usable.
    pub fn load(config: &Config, assets_dir: &Path) -> Self {
        let mut buttons = Vec::with_capacity(config.buttons.len());
        for (id, entry) in &config.buttons {
            let image_path = assets_dir.join(&entry.image);
            let template = match image::open(&image_path) {
                Ok(img) => Some(img.to_luma8()),
                Err(err) => {
                    warn!(
                        "template for [{id}] unavailable ({}): {err}",
                        image_path.display()
                    );
                    None
                }
            };

            let aliases = entry
                .aliases
                .iter()
                .map(|alias| normalize_token(alias))
                .filter(|alias| !alias.is_empty())
                .collect();

            buttons.push(ButtonDefinition {
                id: id.clone(),
                image_path,
                template,
                default_action: entry.action,
                deny_class: entry.deny_class.unwrap_or_else(|| default_deny_class(id)),
                aliases,
                description: entry.description.clone(),
            });
        }

        Self { buttons }
    }

    pub fn all(&self) -> &[ButtonDefinition] {
        &self.buttons
    }

    pub fn get(&self, id: &str) -> Option<&ButtonDefinition> {
        self.buttons.iter().find(|button| button.id == id)
    }

    pub fn len(&self) -> usize {
        self.buttons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
    }

    /// Buttons whose template actually decoded.
    pub fn loaded_count(&self) -> usize {
        self.buttons
            .iter()
            .filter(|button| button.template.is_some())
            .count()
    }

    /// Ids of every button in the given class, in store order.
    pub fn ids_in_class(&self, deny_class: bool) -> Vec<String> {
        self.buttons
            .iter()
            .filter(|button| button.deny_class == deny_class)
            .map(|button| button.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ButtonEntry, Config};
    use image::GrayImage;
    use tempfile::tempdir;

    fn entry(image: &str, action: ButtonAction, aliases: &[&str]) -> ButtonEntry {
        ButtonEntry {
            image: image.to_string(),
            action,
            description: String::new(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            deny_class: None,
        }
    }

    #[test]
    fn normalize_strips_case_and_whitespace() {
        assert_eq!(normalize_token("Alt + Enter"), "alt+enter");
        assert_eq!(normalize_token("  Confirm\t"), "confirm");
        assert_eq!(normalize_token("alt+enter"), "alt+enter");
        assert_eq!(normalize_token("   "), "");
    }

    #[test]
    fn deny_class_inferred_from_id() {
        assert!(default_deny_class("deny"));
        assert!(default_deny_class("reject_all"));
        assert!(default_deny_class("cancel"));
        assert!(!default_deny_class("confirm"));
        assert!(!default_deny_class("accept"));
        // Approve markers win when both appear.
        assert!(!default_deny_class("deny_confirm_combo"));
        assert!(!default_deny_class("accept_reject_combo"));
        assert!(!default_deny_class("other"));
    }

    #[test]
    fn action_parses_case_insensitively() {
        assert_eq!("Approve".parse::<ButtonAction>().unwrap(), ButtonAction::Approve);
        assert_eq!("deny".parse::<ButtonAction>().unwrap(), ButtonAction::Deny);
        assert_eq!("SKIP".parse::<ButtonAction>().unwrap(), ButtonAction::Skip);
        assert!("maybe".parse::<ButtonAction>().is_err());
    }

    #[test]
    fn load_decodes_present_templates_and_tolerates_missing() {
        let dir = tempdir().unwrap();
        let image = GrayImage::from_fn(8, 6, |x, y| image::Luma([(x * 20 + y * 10) as u8]));
        image.save(dir.path().join("ok.png")).unwrap();

        let mut config = Config::default();
        config.buttons.clear();
        config
            .buttons
            .insert("confirm".into(), entry("ok.png", ButtonAction::Approve, &[]));
        config.buttons.insert(
            "deny".into(),
            entry("missing.png", ButtonAction::Skip, &[" Escape ", "ESC", ""]),
        );

        let store = TemplateStore::load(&config, dir.path());
        assert_eq!(store.len(), 2);
        assert_eq!(store.loaded_count(), 1);

        let confirm = store.get("confirm").unwrap();
        assert!(confirm.template.is_some());
        assert!(!confirm.deny_class);

        let deny = store.get("deny").unwrap();
        assert!(deny.template.is_none());
        assert!(deny.deny_class);
        assert_eq!(deny.aliases, vec!["escape".to_string(), "esc".to_string()]);

        assert!(store.get("other").is_none());
    }

    #[test]
    fn store_order_is_stable() {
        let config = Config::default();
        let dir = tempdir().unwrap();
        let store = TemplateStore::load(&config, dir.path());

        let ids: Vec<&str> = store.all().iter().map(|b| b.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert!(ids.contains(&"confirm"));
    }

    #[test]
    fn class_partition_covers_defaults() {
        let config = Config::default();
        let dir = tempdir().unwrap();
        let store = TemplateStore::load(&config, dir.path());

        let approve_class = store.ids_in_class(false);
        let deny_class = store.ids_in_class(true);
        assert!(approve_class.contains(&"confirm".to_string()));
        assert!(deny_class.contains(&"deny".to_string()));
        assert_eq!(approve_class.len() + deny_class.len(), store.len());
    }
}
