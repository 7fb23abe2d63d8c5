use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::buttons::ButtonAction;
use crate::rules::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The resolved rule said not to touch this button.
    Rule,
    /// A recent dispatch for the same button is still cooling down.
    Cooldown,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Rule => "rule",
            SkipReason::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Dispatched,
    Skipped(SkipReason),
    Failed(String),
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Dispatched => "dispatched",
            ActionOutcome::Skipped(_) => "skipped",
            ActionOutcome::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            ActionOutcome::Dispatched => None,
            ActionOutcome::Skipped(reason) => Some(reason.as_str().to_string()),
            ActionOutcome::Failed(err) => Some(err.clone()),
        }
    }
}

/// One decision the dispatcher took for one detection (or hotkey press).
#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub occurred_at: DateTime<Utc>,
    pub button_id: String,
    pub action: ButtonAction,
    pub source: SourceKind,
    pub outcome: ActionOutcome,
    pub confidence: Option<f32>,
}

pub type EventSender = mpsc::UnboundedSender<ActionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ActionEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Running totals for one watch session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub approved: u64,
    pub denied: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SessionStats {
    pub fn absorb(&mut self, event: &ActionEvent) {
        match &event.outcome {
            ActionOutcome::Dispatched => match event.action {
                ButtonAction::Approve => self.approved += 1,
                ButtonAction::Deny => self.denied += 1,
                ButtonAction::Skip => {}
            },
            ActionOutcome::Skipped(_) => self.skipped += 1,
            ActionOutcome::Failed(_) => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(action: ButtonAction, outcome: ActionOutcome) -> ActionEvent {
        ActionEvent {
            occurred_at: Utc::now(),
            button_id: "confirm".to_string(),
            action,
            source: SourceKind::ConfigDefault,
            outcome,
            confidence: Some(0.9),
        }
    }

    #[test]
    fn stats_absorb_by_outcome() {
        let mut stats = SessionStats::default();
        stats.absorb(&event(ButtonAction::Approve, ActionOutcome::Dispatched));
        stats.absorb(&event(ButtonAction::Approve, ActionOutcome::Dispatched));
        stats.absorb(&event(ButtonAction::Deny, ActionOutcome::Dispatched));
        stats.absorb(&event(ButtonAction::Skip, ActionOutcome::Skipped(SkipReason::Rule)));
        stats.absorb(&event(
            ButtonAction::Approve,
            ActionOutcome::Skipped(SkipReason::Cooldown),
        ));
        stats.absorb(&event(
            ButtonAction::Deny,
            ActionOutcome::Failed("no backend".to_string()),
        ));

        assert_eq!(
            stats,
            SessionStats { approved: 2, denied: 1, skipped: 2, failed: 1 }
        );
    }

    #[test]
    fn outcome_labels_and_detail() {
        assert_eq!(ActionOutcome::Dispatched.as_str(), "dispatched");
        assert_eq!(ActionOutcome::Dispatched.detail(), None);
        assert_eq!(
            ActionOutcome::Skipped(SkipReason::Cooldown).detail().as_deref(),
            Some("cooldown")
        );
        assert_eq!(
            ActionOutcome::Failed("boom".to_string()).detail().as_deref(),
            Some("boom")
        );
    }
}
