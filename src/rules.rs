use std::collections::{HashMap, HashSet};

use crate::buttons::{normalize_token, ButtonAction, TemplateStore};

/// Where a resolved action came from, carried through to events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    ChatOcr,
    AllowFile,
    ConfigDefault,
    Manual,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ChatOcr => "chat_ocr",
            SourceKind::AllowFile => "allow_file",
            SourceKind::ConfigDefault => "config_default",
            SourceKind::Manual => "manual",
        }
    }
}

/// A provider of the current token set, consulted in priority order.
pub trait RuleSource {
    fn kind(&self) -> SourceKind;
    /// Fresh, non-empty tokens, or None when this source currently has
    /// nothing to say.
    fn current_tokens(&self) -> Option<HashSet<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAction {
    pub action: ButtonAction,
    pub source: SourceKind,
}

/// Effective per-button actions for one tick. Total over all button ids:
/// anything unknown resolves to Skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    actions: HashMap<String, ResolvedAction>,
}

impl RuleTable {
    pub fn action_for(&self, button_id: &str) -> ResolvedAction {
        self.actions.get(button_id).copied().unwrap_or(ResolvedAction {
            action: ButtonAction::Skip,
            source: SourceKind::ConfigDefault,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvePolicy {
    pub chat_enabled: bool,
    /// Binds only while chat mode is enabled: with fallback off, a silent
    /// chat source means every button skips.
    pub fallback_to_config: bool,
}

/// Splits raw source text into normalized tokens. Commas and newlines
/// separate entries; empty pieces vanish.
pub fn parse_tokens(raw: &str) -> HashSet<String> {
    raw.split(|c| c == ',' || c == '\n' || c == '\r')
        .map(normalize_token)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Pure resolution step: same store, sources and policy always produce the
/// same table. The first source with tokens is authoritative; later sources
/// and config defaults are not blended in.
pub fn resolve(store: &TemplateStore, sources: &[&dyn RuleSource], policy: ResolvePolicy) -> RuleTable {
    for source in sources {
        if let Some(tokens) = source.current_tokens() {
            if !tokens.is_empty() {
                return table_from_tokens(store, &tokens, source.kind());
            }
        }
    }

    if policy.chat_enabled && !policy.fallback_to_config {
        let actions = store
            .all()
            .iter()
            .map(|button| {
                (
                    button.id.clone(),
                    ResolvedAction {
                        action: ButtonAction::Skip,
                        source: SourceKind::ChatOcr,
                    },
                )
            })
            .collect();
        return RuleTable { actions };
    }

    let actions = store
        .all()
        .iter()
        .map(|button| {
            (
                button.id.clone(),
                ResolvedAction {
                    action: button.default_action,
                    source: SourceKind::ConfigDefault,
                },
            )
        })
        .collect();
    RuleTable { actions }
}

fn table_from_tokens(store: &TemplateStore, tokens: &HashSet<String>, source: SourceKind) -> RuleTable {
    let mut actions = HashMap::with_capacity(store.len());
    for button in store.all() {
        let id_named = tokens.contains(&normalize_token(&button.id));
        let alias_named = button.aliases.iter().any(|alias| tokens.contains(alias));

        // An alias carried by a deny-class button ("escape") asks for
        // dismissal, and wins even when the id is also listed.
        let action = if button.deny_class && alias_named {
            ButtonAction::Deny
        } else if id_named || alias_named {
            ButtonAction::Approve
        } else {
            ButtonAction::Skip
        };

        actions.insert(button.id.clone(), ResolvedAction { action, source });
    }
    RuleTable { actions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    struct FakeSource {
        kind: SourceKind,
        tokens: Option<HashSet<String>>,
    }

    impl FakeSource {
        fn with(kind: SourceKind, tokens: &[&str]) -> Self {
            Self {
                kind,
                tokens: Some(tokens.iter().map(|t| t.to_string()).collect()),
            }
        }

        fn silent(kind: SourceKind) -> Self {
            Self { kind, tokens: None }
        }
    }

    impl RuleSource for FakeSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn current_tokens(&self) -> Option<HashSet<String>> {
            self.tokens.clone()
        }
    }

    fn default_store() -> TemplateStore {
        let dir = tempdir().unwrap();
        TemplateStore::load(&Config::default(), dir.path())
    }

    const FALLBACK: ResolvePolicy = ResolvePolicy {
        chat_enabled: false,
        fallback_to_config: true,
    };

    #[test]
    fn parse_splits_on_commas_and_newlines() {
        let tokens = parse_tokens("confirm, accept");
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains("confirm"));
        assert!(tokens.contains("accept"));

        let tokens = parse_tokens("confirm\ndeny_confirm_combo\r\n");
        assert_eq!(tokens.len(), 2);

        let tokens = parse_tokens("Alt + Enter");
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains("alt+enter"));

        assert!(parse_tokens("").is_empty());
        assert!(parse_tokens(" ,\n, ").is_empty());
    }

    #[test]
    fn no_sources_falls_back_to_config_defaults() {
        let store = default_store();
        let table = resolve(&store, &[], FALLBACK);

        let confirm = table.action_for("confirm");
        assert_eq!(confirm.action, ButtonAction::Approve);
        assert_eq!(confirm.source, SourceKind::ConfigDefault);
        assert_eq!(table.action_for("accept").action, ButtonAction::Skip);
        assert_eq!(table.action_for("deny").action, ButtonAction::Skip);
    }

    #[test]
    fn token_membership_approves_named_buttons_only() {
        let store = default_store();
        let file = FakeSource::with(SourceKind::AllowFile, &["confirm"]);
        let table = resolve(&store, &[&file], FALLBACK);

        let confirm = table.action_for("confirm");
        assert_eq!(confirm.action, ButtonAction::Approve);
        assert_eq!(confirm.source, SourceKind::AllowFile);
        // Config default for deny_confirm_combo is Approve; the token list
        // replaces defaults instead of blending with them.
        assert_eq!(table.action_for("deny_confirm_combo").action, ButtonAction::Skip);
        assert_eq!(table.action_for("accept").action, ButtonAction::Skip);
    }

    #[test]
    fn alias_token_approves_its_button() {
        let store = default_store();
        let file = FakeSource::with(SourceKind::AllowFile, &["alt+enter"]);
        let table = resolve(&store, &[&file], FALLBACK);

        assert_eq!(table.action_for("accept").action, ButtonAction::Approve);
        assert_eq!(table.action_for("confirm").action, ButtonAction::Skip);
    }

    #[test]
    fn deny_class_alias_resolves_to_deny() {
        let store = default_store();
        let file = FakeSource::with(SourceKind::AllowFile, &["escape"]);
        let table = resolve(&store, &[&file], FALLBACK);

        assert_eq!(table.action_for("deny").action, ButtonAction::Deny);
        assert_eq!(table.action_for("reject").action, ButtonAction::Skip);
    }

    #[test]
    fn deny_alias_wins_over_id_mention() {
        let store = default_store();
        let file = FakeSource::with(SourceKind::AllowFile, &["deny", "escape"]);
        let table = resolve(&store, &[&file], FALLBACK);

        assert_eq!(table.action_for("deny").action, ButtonAction::Deny);
    }

    #[test]
    fn first_source_with_tokens_is_authoritative() {
        let store = default_store();
        let chat = FakeSource::with(SourceKind::ChatOcr, &["confirm"]);
        let file = FakeSource::with(SourceKind::AllowFile, &["accept"]);

        let table = resolve(&store, &[&chat, &file], FALLBACK);
        assert_eq!(table.action_for("confirm").action, ButtonAction::Approve);
        assert_eq!(table.action_for("confirm").source, SourceKind::ChatOcr);
        assert_eq!(table.action_for("accept").action, ButtonAction::Skip);

        let table = resolve(&store, &[&file, &chat], FALLBACK);
        assert_eq!(table.action_for("accept").action, ButtonAction::Approve);
        assert_eq!(table.action_for("accept").source, SourceKind::AllowFile);
        assert_eq!(table.action_for("confirm").action, ButtonAction::Skip);
    }

    #[test]
    fn silent_source_defers_to_the_next() {
        let store = default_store();
        let chat = FakeSource::silent(SourceKind::ChatOcr);
        let file = FakeSource::with(SourceKind::AllowFile, &["confirm"]);

        let table = resolve(&store, &[&chat, &file], FALLBACK);
        assert_eq!(table.action_for("confirm").source, SourceKind::AllowFile);
    }

    #[test]
    fn chat_mode_without_fallback_skips_everything() {
        let store = default_store();
        let chat = FakeSource::silent(SourceKind::ChatOcr);
        let policy = ResolvePolicy {
            chat_enabled: true,
            fallback_to_config: false,
        };

        let table = resolve(&store, &[&chat], policy);
        for button in store.all() {
            let resolved = table.action_for(&button.id);
            assert_eq!(resolved.action, ButtonAction::Skip);
            assert_eq!(resolved.source, SourceKind::ChatOcr);
        }
    }

    #[test]
    fn file_tokens_apply_without_fallback_when_chat_is_silent() {
        let store = default_store();
        let chat = FakeSource::silent(SourceKind::ChatOcr);
        let file = FakeSource::with(SourceKind::AllowFile, &["confirm"]);
        let policy = ResolvePolicy {
            chat_enabled: true,
            fallback_to_config: false,
        };

        // fallback_to_config fences off config defaults only; a later
        // dynamic source still gets its turn.
        let table = resolve(&store, &[&chat, &file], policy);
        let confirm = table.action_for("confirm");
        assert_eq!(confirm.action, ButtonAction::Approve);
        assert_eq!(confirm.source, SourceKind::AllowFile);

        let combo = table.action_for("deny_confirm_combo");
        assert_eq!(combo.action, ButtonAction::Skip);
        assert_eq!(combo.source, SourceKind::AllowFile);
    }

    #[test]
    fn chat_mode_with_fallback_uses_defaults_when_silent() {
        let store = default_store();
        let chat = FakeSource::silent(SourceKind::ChatOcr);
        let policy = ResolvePolicy {
            chat_enabled: true,
            fallback_to_config: true,
        };

        let table = resolve(&store, &[&chat], policy);
        assert_eq!(table.action_for("confirm").action, ButtonAction::Approve);
        assert_eq!(table.action_for("confirm").source, SourceKind::ConfigDefault);
    }

    #[test]
    fn resolution_is_deterministic_and_total() {
        let store = default_store();
        let file = FakeSource::with(SourceKind::AllowFile, &["confirm", "escape"]);

        let first = resolve(&store, &[&file], FALLBACK);
        let second = resolve(&store, &[&file], FALLBACK);
        assert_eq!(first, second);

        for button in store.all() {
            // Every id resolves; no panics, no gaps.
            let _ = first.action_for(&button.id);
        }
        assert_eq!(first.action_for("never_configured").action, ButtonAction::Skip);
    }
}
