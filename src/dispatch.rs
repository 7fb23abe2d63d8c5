use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use enigo::Key;
use log::{debug, info, warn};

use crate::alert::AlertHandle;
use crate::buttons::{ButtonAction, TemplateStore};
use crate::config::Settings;
use crate::events::{ActionEvent, ActionOutcome, EventSender, SkipReason};
use crate::input::{self, SharedInput};
use crate::rules::{ResolvedAction, RuleTable, SourceKind};
use crate::scanner::DetectionMatch;

/// Keyboard gesture that answers a dialog affirmatively when clicking
/// the detected button would do the opposite.
pub const APPROVE_COMBO: &str = "alt+enter";
/// Keyboard gesture that dismisses a dialog.
pub const DISMISS_COMBO: &str = "escape";

/// Per-button dispatch timestamps. Shared by the scan path and the
/// hotkey path so the two cannot both fire inside one cooldown window.
pub struct CooldownLedger {
    entries: Mutex<HashMap<String, Instant>>,
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false while `id` is still cooling down; otherwise stamps
    /// it and returns true. Check and stamp happen under one lock.
    pub fn try_begin(&self, id: &str, cooldown: Duration) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = entries.get(id) {
            if now.duration_since(*last) < cooldown {
                return false;
            }
        }
        entries.insert(id.to_string(), now);
        true
    }

    /// All-or-nothing variant for blind answers that stand in for a
    /// whole class of buttons: suppressed when any id is cooling,
    /// stamps every id when it fires.
    pub fn try_begin_all(&self, ids: &[String], cooldown: Duration) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let blocked = ids.iter().any(|id| {
            entries
                .get(id)
                .is_some_and(|last| now.duration_since(*last) < cooldown)
        });
        if blocked {
            return false;
        }
        for id in ids {
            entries.insert(id.clone(), now);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualAnswer {
    Approve,
    Deny,
}

enum Gesture {
    Click((i32, i32)),
    Combo { keys: Vec<Key>, label: &'static str },
}

impl Gesture {
    fn describe(&self) -> String {
        match self {
            Gesture::Click((x, y)) => format!("click at ({x}, {y})"),
            Gesture::Combo { label, .. } => format!("key combo '{label}'"),
        }
    }
}

/// Turns detections plus the effective rule table into input gestures,
/// emitting one event per decision.
pub struct Dispatcher {
    store: Arc<RwLock<TemplateStore>>,
    ledger: CooldownLedger,
    input: SharedInput,
    alert: AlertHandle,
    events: EventSender,
    approve_combo: Vec<Key>,
    dismiss_combo: Vec<Key>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<RwLock<TemplateStore>>,
        input: SharedInput,
        alert: AlertHandle,
        events: EventSender,
    ) -> Result<Self> {
        let approve_combo =
            input::parse_combo(APPROVE_COMBO).context("failed to parse approve key combo")?;
        let dismiss_combo =
            input::parse_combo(DISMISS_COMBO).context("failed to parse dismiss key combo")?;
        Ok(Self {
            store,
            ledger: CooldownLedger::new(),
            input,
            alert,
            events,
            approve_combo,
            dismiss_combo,
        })
    }

    /// At most one gesture per pass. Skips are recorded as they are
    /// passed over; the first cooldown-granted non-skip match is
    /// dispatched and ends the pass, since the gesture invalidates the
    /// frame the remaining coordinates came from. The next scan decides
    /// whatever is still on screen.
    pub async fn handle_matches(
        &self,
        matches: &[DetectionMatch],
        rules: &RuleTable,
        settings: &Settings,
    ) {
        let cooldown = Duration::from_secs_f64(settings.cooldown);
        let mut beeped = false;
        for hit in matches {
            let resolved = rules.action_for(&hit.button_id);
            match resolved.action {
                ButtonAction::Skip => {
                    self.skip(hit, resolved, SkipReason::Rule, settings, &mut beeped);
                }
                ButtonAction::Approve | ButtonAction::Deny => {
                    if !self.ledger.try_begin(&hit.button_id, cooldown) {
                        self.skip(hit, resolved, SkipReason::Cooldown, settings, &mut beeped);
                        continue;
                    }
                    self.dispatch_one(hit, resolved, settings).await;
                    return;
                }
            }
        }
    }

    /// Hotkey answer with no detection behind it. Sends the class combo
    /// blind and stamps every button of that class, since we cannot
    /// know which one the user was looking at.
    pub async fn manual_answer(&self, answer: ManualAnswer, settings: &Settings) {
        let (action, keys, label, deny_class) = match answer {
            ManualAnswer::Approve => (
                ButtonAction::Approve,
                self.approve_combo.clone(),
                APPROVE_COMBO,
                false,
            ),
            ManualAnswer::Deny => (
                ButtonAction::Deny,
                self.dismiss_combo.clone(),
                DISMISS_COMBO,
                true,
            ),
        };

        let class_ids = {
            let store = self.store.read().unwrap();
            store.ids_in_class(deny_class)
        };
        let cooldown = Duration::from_secs_f64(settings.cooldown);
        let button_id = format!("hotkey:{}", action.as_str());

        if !self.ledger.try_begin_all(&class_ids, cooldown) {
            debug!("Manual {} suppressed, class still cooling down", action.as_str());
            self.emit(ActionEvent {
                occurred_at: Utc::now(),
                button_id,
                action,
                source: SourceKind::Manual,
                outcome: ActionOutcome::Skipped(SkipReason::Cooldown),
                confidence: None,
            });
            return;
        }

        let gesture = Gesture::Combo { keys, label };
        let described = gesture.describe();
        let outcome = match self.perform(gesture).await {
            Ok(()) => {
                info!("Manual {} via {described}", action.as_str());
                ActionOutcome::Dispatched
            }
            Err(err) => {
                warn!("Manual {} failed: {err:#}", action.as_str());
                ActionOutcome::Failed(format!("{err:#}"))
            }
        };

        self.emit(ActionEvent {
            occurred_at: Utc::now(),
            button_id,
            action,
            source: SourceKind::Manual,
            outcome,
            confidence: None,
        });
    }

    async fn dispatch_one(
        &self,
        hit: &DetectionMatch,
        resolved: ResolvedAction,
        settings: &Settings,
    ) {
        let deny_class = {
            let store = self.store.read().unwrap();
            store
                .get(&hit.button_id)
                .map(|button| button.deny_class)
                .unwrap_or(false)
        };

        // Grace period for the dialog to finish rendering.
        if settings.action_delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(settings.action_delay)).await;
        }

        // Clicking a button carries out that button's meaning, so an
        // action matching the button's class is a plain click and a
        // contrary action goes through the keyboard instead.
        let gesture = match (resolved.action, deny_class) {
            (ButtonAction::Approve, false) | (ButtonAction::Deny, true) => {
                Gesture::Click(hit.region.center())
            }
            (ButtonAction::Approve, true) => Gesture::Combo {
                keys: self.approve_combo.clone(),
                label: APPROVE_COMBO,
            },
            (ButtonAction::Deny, false) => Gesture::Combo {
                keys: self.dismiss_combo.clone(),
                label: DISMISS_COMBO,
            },
            (ButtonAction::Skip, _) => return,
        };

        let described = gesture.describe();
        let outcome = match self.perform(gesture).await {
            Ok(()) => {
                info!(
                    "Dispatched {} for '{}': {described} (confidence {:.3}, source {})",
                    resolved.action.as_str(),
                    hit.button_id,
                    hit.confidence,
                    resolved.source.as_str()
                );
                ActionOutcome::Dispatched
            }
            Err(err) => {
                warn!("Input injection failed for '{}': {err:#}", hit.button_id);
                ActionOutcome::Failed(format!("{err:#}"))
            }
        };

        self.emit(ActionEvent {
            occurred_at: Utc::now(),
            button_id: hit.button_id.clone(),
            action: resolved.action,
            source: resolved.source,
            outcome,
            confidence: Some(hit.confidence),
        });
    }

    fn skip(
        &self,
        hit: &DetectionMatch,
        resolved: ResolvedAction,
        reason: SkipReason,
        settings: &Settings,
        beeped: &mut bool,
    ) {
        match reason {
            SkipReason::Rule => {
                info!(
                    "Skipping '{}' per {} rules (confidence {:.3})",
                    hit.button_id,
                    resolved.source.as_str(),
                    hit.confidence
                );
            }
            SkipReason::Cooldown => {
                debug!("'{}' still cooling down", hit.button_id);
            }
        }
        // One audible alert per pass, however many matches skip.
        if settings.sound_alert_on_skip && !*beeped {
            self.alert.beep();
            *beeped = true;
        }

        self.emit(ActionEvent {
            occurred_at: Utc::now(),
            button_id: hit.button_id.clone(),
            action: resolved.action,
            source: resolved.source,
            outcome: ActionOutcome::Skipped(reason),
            confidence: Some(hit.confidence),
        });
    }

    async fn perform(&self, gesture: Gesture) -> Result<()> {
        let input = Arc::clone(&self.input);
        tokio::task::spawn_blocking(move || {
            let mut driver = input.lock().unwrap();
            match gesture {
                Gesture::Click((x, y)) => driver.click_at(x, y),
                Gesture::Combo { keys, .. } => driver.key_combo(&keys),
            }
        })
        .await
        .context("input task failed to join")?
    }

    fn emit(&self, event: ActionEvent) {
        // The receiver outlives the dispatcher in normal runs; a closed
        // channel only means shutdown is already underway.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{self, EventReceiver};
    use crate::rules::{self, ResolvePolicy};
    use crate::scanner::Region;
    use anyhow::bail;

    #[derive(Default)]
    struct Recorder {
        clicks: Vec<(i32, i32)>,
        combos: Vec<Vec<Key>>,
        fail: bool,
    }

    struct FakeDriver(Arc<Mutex<Recorder>>);

    impl crate::input::InputDriver for FakeDriver {
        fn click_at(&mut self, x: i32, y: i32) -> Result<()> {
            let mut recorder = self.0.lock().unwrap();
            if recorder.fail {
                bail!("injection backend offline");
            }
            recorder.clicks.push((x, y));
            Ok(())
        }

        fn key_combo(&mut self, keys: &[Key]) -> Result<()> {
            let mut recorder = self.0.lock().unwrap();
            if recorder.fail {
                bail!("injection backend offline");
            }
            recorder.combos.push(keys.to_vec());
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<RwLock<TemplateStore>>,
        recorder: Arc<Mutex<Recorder>>,
        events: EventReceiver,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        /// Rule table from config defaults, no dynamic sources.
        fn default_rules(&self) -> RuleTable {
            let store = self.store.read().unwrap();
            rules::resolve(
                &store,
                &[],
                ResolvePolicy { chat_enabled: false, fallback_to_config: true },
            )
        }
    }

    fn harness(action_overrides: &[(&str, ButtonAction)]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        for (id, action) in action_overrides {
            if let Some(entry) = config.buttons.get_mut(*id) {
                entry.action = *action;
            }
        }
        // No template images on disk; dispatch only needs classes.
        let store = Arc::new(RwLock::new(TemplateStore::load(&config, dir.path())));
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let input = input::shared(FakeDriver(Arc::clone(&recorder)));
        let (tx, rx) = events::channel();
        let dispatcher =
            Dispatcher::new(Arc::clone(&store), input, AlertHandle::new(), tx).unwrap();
        Harness { dispatcher, store, recorder, events: rx, _dir: dir }
    }

    fn fast_settings() -> Settings {
        Settings {
            action_delay: 0.0,
            cooldown: 0.05,
            sound_alert_on_skip: false,
            ..Settings::default()
        }
    }

    fn hit(id: &str) -> DetectionMatch {
        DetectionMatch {
            button_id: id.to_string(),
            region: Region { x: 10, y: 10, width: 30, height: 30 },
            confidence: 0.95,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn approve_clicks_button_center() {
        let mut h = harness(&[]);
        let rules = h.default_rules();

        h.dispatcher
            .handle_matches(&[hit("confirm")], &rules, &fast_settings())
            .await;

        let recorder = h.recorder.lock().unwrap();
        assert_eq!(recorder.clicks, vec![(25, 25)]);
        assert!(recorder.combos.is_empty());
        drop(recorder);

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.button_id, "confirm");
        assert_eq!(event.action, ButtonAction::Approve);
        assert_eq!(event.source, SourceKind::ConfigDefault);
        assert_eq!(event.outcome, ActionOutcome::Dispatched);
        assert_eq!(event.confidence, Some(0.95));
    }

    #[tokio::test]
    async fn skip_rule_never_touches_input() {
        let mut h = harness(&[]);
        let rules = h.default_rules();

        // Default action for "deny" is skip.
        h.dispatcher
            .handle_matches(&[hit("deny")], &rules, &fast_settings())
            .await;

        let recorder = h.recorder.lock().unwrap();
        assert!(recorder.clicks.is_empty());
        assert!(recorder.combos.is_empty());
        drop(recorder);

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.outcome, ActionOutcome::Skipped(SkipReason::Rule));
    }

    #[tokio::test]
    async fn approving_deny_class_button_sends_accept_combo() {
        let mut h = harness(&[("deny", ButtonAction::Approve)]);
        let rules = h.default_rules();

        h.dispatcher
            .handle_matches(&[hit("deny")], &rules, &fast_settings())
            .await;

        let recorder = h.recorder.lock().unwrap();
        assert!(recorder.clicks.is_empty());
        assert_eq!(recorder.combos, vec![vec![Key::Alt, Key::Return]]);
        drop(recorder);

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.action, ButtonAction::Approve);
        assert_eq!(event.outcome, ActionOutcome::Dispatched);
    }

    #[tokio::test]
    async fn denying_approve_class_button_sends_dismiss() {
        let h = harness(&[("confirm", ButtonAction::Deny)]);
        let rules = h.default_rules();

        h.dispatcher
            .handle_matches(&[hit("confirm")], &rules, &fast_settings())
            .await;

        let recorder = h.recorder.lock().unwrap();
        assert!(recorder.clicks.is_empty());
        assert_eq!(recorder.combos, vec![vec![Key::Escape]]);
    }

    #[tokio::test]
    async fn cooldown_suppresses_then_expires() {
        let mut h = harness(&[]);
        let rules = h.default_rules();
        let settings = fast_settings();

        h.dispatcher.handle_matches(&[hit("confirm")], &rules, &settings).await;
        h.dispatcher.handle_matches(&[hit("confirm")], &rules, &settings).await;

        assert_eq!(h.recorder.lock().unwrap().clicks.len(), 1);
        let first = h.events.try_recv().unwrap();
        assert_eq!(first.outcome, ActionOutcome::Dispatched);
        let second = h.events.try_recv().unwrap();
        assert_eq!(second.outcome, ActionOutcome::Skipped(SkipReason::Cooldown));

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.dispatcher.handle_matches(&[hit("confirm")], &rules, &settings).await;
        assert_eq!(h.recorder.lock().unwrap().clicks.len(), 2);
    }

    #[tokio::test]
    async fn manual_answer_shares_ledger_with_scan_path() {
        let mut h = harness(&[]);
        let rules = h.default_rules();
        let settings = fast_settings();

        h.dispatcher.manual_answer(ManualAnswer::Approve, &settings).await;
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.button_id, "hotkey:approve");
        assert_eq!(event.source, SourceKind::Manual);
        assert_eq!(event.outcome, ActionOutcome::Dispatched);
        assert_eq!(event.confidence, None);
        assert_eq!(h.recorder.lock().unwrap().combos, vec![vec![Key::Alt, Key::Return]]);

        // The blind approve stamped every approve-class id, so the scan
        // path must not fire on "confirm" inside the window.
        h.dispatcher.handle_matches(&[hit("confirm")], &rules, &settings).await;
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.outcome, ActionOutcome::Skipped(SkipReason::Cooldown));
        assert!(h.recorder.lock().unwrap().clicks.is_empty());

        // Deny-class ids were not stamped; the deny hotkey still works.
        h.dispatcher.manual_answer(ManualAnswer::Deny, &settings).await;
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.button_id, "hotkey:deny");
        assert_eq!(event.outcome, ActionOutcome::Dispatched);

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.dispatcher.handle_matches(&[hit("confirm")], &rules, &settings).await;
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.outcome, ActionOutcome::Dispatched);
    }

    #[tokio::test]
    async fn failed_injection_reports_and_still_cools() {
        let mut h = harness(&[]);
        let rules = h.default_rules();
        let settings = fast_settings();

        h.recorder.lock().unwrap().fail = true;
        h.dispatcher.handle_matches(&[hit("confirm")], &rules, &settings).await;

        let event = h.events.try_recv().unwrap();
        match &event.outcome {
            ActionOutcome::Failed(detail) => assert!(detail.contains("injection backend offline")),
            other => panic!("expected failure, got {other:?}"),
        }

        // The attempt was stamped before it ran, so the button cools
        // down even though injection failed.
        h.recorder.lock().unwrap().fail = false;
        h.dispatcher.handle_matches(&[hit("confirm")], &rules, &settings).await;
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.outcome, ActionOutcome::Skipped(SkipReason::Cooldown));
        assert!(h.recorder.lock().unwrap().clicks.is_empty());
    }

    #[tokio::test]
    async fn mixed_batch_keeps_match_order() {
        let mut h = harness(&[]);
        let rules = h.default_rules();

        // "deny" skips by rule, so the walk carries on to "confirm".
        h.dispatcher
            .handle_matches(&[hit("deny"), hit("confirm")], &rules, &fast_settings())
            .await;

        let first = h.events.try_recv().unwrap();
        assert_eq!(first.button_id, "deny");
        assert_eq!(first.outcome, ActionOutcome::Skipped(SkipReason::Rule));
        let second = h.events.try_recv().unwrap();
        assert_eq!(second.button_id, "confirm");
        assert_eq!(second.outcome, ActionOutcome::Dispatched);
        assert_eq!(h.recorder.lock().unwrap().clicks.len(), 1);
    }

    #[tokio::test]
    async fn co_matching_buttons_get_one_gesture_per_pass() {
        let mut h = harness(&[]);
        let rules = h.default_rules();
        let settings = Settings { cooldown: 60.0, ..fast_settings() };

        // Both resolve to Approve out of the box and can sit on one
        // dialog; the second center is stale the moment the first click
        // lands.
        let mut combo = hit("deny_confirm_combo");
        combo.region.x = 60;
        let batch = [hit("confirm"), combo];

        h.dispatcher.handle_matches(&batch, &rules, &settings).await;

        assert_eq!(h.recorder.lock().unwrap().clicks, vec![(25, 25)]);
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.button_id, "confirm");
        assert_eq!(event.outcome, ActionOutcome::Dispatched);
        assert!(h.events.try_recv().is_err());

        // A rescan sees both again: the acted id is cooling, the one
        // that waited fires now at its own center.
        h.dispatcher.handle_matches(&batch, &rules, &settings).await;

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.button_id, "confirm");
        assert_eq!(event.outcome, ActionOutcome::Skipped(SkipReason::Cooldown));
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.button_id, "deny_confirm_combo");
        assert_eq!(event.outcome, ActionOutcome::Dispatched);
        assert_eq!(h.recorder.lock().unwrap().clicks, vec![(25, 25), (75, 25)]);
    }

    #[test]
    fn ledger_try_begin_checks_and_stamps() {
        let ledger = CooldownLedger::new();
        let window = Duration::from_millis(50);

        assert!(ledger.try_begin("confirm", window));
        assert!(!ledger.try_begin("confirm", window));
        assert!(ledger.try_begin("deny", window));

        std::thread::sleep(Duration::from_millis(60));
        assert!(ledger.try_begin("confirm", window));
    }

    #[test]
    fn ledger_try_begin_all_is_all_or_nothing() {
        let ledger = CooldownLedger::new();
        let window = Duration::from_millis(50);

        assert!(ledger.try_begin("a", window));
        let blocked =
            ledger.try_begin_all(&["a".to_string(), "b".to_string()], window);
        assert!(!blocked);
        // "b" must not have been stamped by the failed attempt.
        assert!(ledger.try_begin("b", window));

        assert!(ledger.try_begin_all(&[], window));
    }
}
