use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use global_hotkey::{
    hotkey::{Code, HotKey, Modifiers},
    GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState,
};
use log::{debug, info};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, HotkeyConfig};
use crate::dispatch::{Dispatcher, ManualAnswer};

const POLL_INTERVAL_MS: u64 = 50;

/// Global approve/deny/quit bindings. The manager is not Send on every
/// platform, so the listener runs on the main task.
pub struct HotkeyListener {
    manager: GlobalHotKeyManager,
    approve: HotKey,
    deny: HotKey,
    quit: HotKey,
}

impl HotkeyListener {
    pub fn register(config: &HotkeyConfig) -> Result<Self> {
        let approve = parse_binding(&config.approve)
            .with_context(|| format!("invalid approve hotkey '{}'", config.approve))?;
        let deny = parse_binding(&config.deny)
            .with_context(|| format!("invalid deny hotkey '{}'", config.deny))?;
        let quit = parse_binding(&config.quit)
            .with_context(|| format!("invalid quit hotkey '{}'", config.quit))?;

        let manager =
            GlobalHotKeyManager::new().context("failed to create global hotkey manager")?;
        manager
            .register(approve)
            .with_context(|| format!("failed to register approve hotkey '{}'", config.approve))?;
        manager
            .register(deny)
            .with_context(|| format!("failed to register deny hotkey '{}'", config.deny))?;
        manager
            .register(quit)
            .with_context(|| format!("failed to register quit hotkey '{}'", config.quit))?;

        info!(
            "Registered hotkeys: approve={}, deny={}, quit={}",
            config.approve, config.deny, config.quit
        );

        Ok(Self { manager, approve, deny, quit })
    }

    /// Polls the hotkey event queue until the session token cancels,
    /// then releases every registration.
    pub async fn run(
        self,
        dispatcher: Arc<Dispatcher>,
        config: Arc<ConfigStore>,
        cancel: CancellationToken,
    ) {
        let receiver = GlobalHotKeyEvent::receiver();
        let mut ticker = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while let Ok(event) = receiver.try_recv() {
                        if event.state != HotKeyState::Pressed {
                            continue;
                        }
                        if event.id == self.approve.id() {
                            info!("Approve hotkey pressed");
                            let settings = config.config().settings;
                            dispatcher.manual_answer(ManualAnswer::Approve, &settings).await;
                        } else if event.id == self.deny.id() {
                            info!("Deny hotkey pressed");
                            let settings = config.config().settings;
                            dispatcher.manual_answer(ManualAnswer::Deny, &settings).await;
                        } else if event.id == self.quit.id() {
                            info!("Quit hotkey pressed, stopping session");
                            cancel.cancel();
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        for hotkey in [self.approve, self.deny, self.quit] {
            if let Err(err) = self.manager.unregister(hotkey) {
                debug!("Failed to unregister hotkey: {err}");
            }
        }
    }
}

const LETTERS: [Code; 26] = [
    Code::KeyA, Code::KeyB, Code::KeyC, Code::KeyD, Code::KeyE, Code::KeyF,
    Code::KeyG, Code::KeyH, Code::KeyI, Code::KeyJ, Code::KeyK, Code::KeyL,
    Code::KeyM, Code::KeyN, Code::KeyO, Code::KeyP, Code::KeyQ, Code::KeyR,
    Code::KeyS, Code::KeyT, Code::KeyU, Code::KeyV, Code::KeyW, Code::KeyX,
    Code::KeyY, Code::KeyZ,
];

const DIGITS: [Code; 10] = [
    Code::Digit0, Code::Digit1, Code::Digit2, Code::Digit3, Code::Digit4,
    Code::Digit5, Code::Digit6, Code::Digit7, Code::Digit8, Code::Digit9,
];

/// Parses "ctrl+shift+y" style bindings: any number of modifiers plus
/// exactly one key.
fn parse_binding(raw: &str) -> Result<HotKey> {
    let mut mods = Modifiers::empty();
    let mut key: Option<Code> = None;

    for part in raw.split('+') {
        let part = part.trim().to_lowercase();
        match part.as_str() {
            "" => bail!("empty key in hotkey '{raw}'"),
            "ctrl" | "control" => mods |= Modifiers::CONTROL,
            "shift" => mods |= Modifiers::SHIFT,
            "alt" | "option" => mods |= Modifiers::ALT,
            "super" | "cmd" | "meta" | "win" => mods |= Modifiers::SUPER,
            name => {
                if key.is_some() {
                    bail!("hotkey '{raw}' has more than one non-modifier key");
                }
                key = Some(code_from_name(name)?);
            }
        }
    }

    let key = key.ok_or_else(|| anyhow!("hotkey '{raw}' has no non-modifier key"))?;
    let mods = (!mods.is_empty()).then_some(mods);
    Ok(HotKey::new(mods, key))
}

fn code_from_name(name: &str) -> Result<Code> {
    let code = match name {
        "enter" | "return" => Code::Enter,
        "escape" | "esc" => Code::Escape,
        "space" => Code::Space,
        "tab" => Code::Tab,
        "backspace" => Code::Backspace,
        "delete" | "del" => Code::Delete,
        "up" => Code::ArrowUp,
        "down" => Code::ArrowDown,
        "left" => Code::ArrowLeft,
        "right" => Code::ArrowRight,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_lowercase() => LETTERS[(c as u8 - b'a') as usize],
                (Some(c), None) if c.is_ascii_digit() => DIGITS[(c as u8 - b'0') as usize],
                _ => bail!("unknown key '{other}'"),
            }
        }
    };
    Ok(code)
}
