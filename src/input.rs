use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

/// Seam between dispatch decisions and the OS input layer.
pub trait InputDriver: Send {
    fn click_at(&mut self, x: i32, y: i32) -> Result<()>;
    /// Presses every key in order, releases in reverse order.
    fn key_combo(&mut self, keys: &[Key]) -> Result<()>;
}

/// The scan loop and the hotkey listener inject through the same driver.
pub type SharedInput = Arc<Mutex<Box<dyn InputDriver>>>;

pub fn shared(driver: impl InputDriver + 'static) -> SharedInput {
    Arc::new(Mutex::new(Box::new(driver)))
}

/// Parses "alt+enter" style combos into the key sequence to hold.
pub fn parse_combo(raw: &str) -> Result<Vec<Key>> {
    let mut keys = Vec::new();
    for part in raw.split('+') {
        let part = part.trim().to_lowercase();
        if part.is_empty() {
            bail!("empty key in combo '{raw}'");
        }
        keys.push(key_from_name(&part)?);
    }
    Ok(keys)
}

fn key_from_name(name: &str) -> Result<Key> {
    let key = match name {
        "alt" | "option" => Key::Alt,
        "ctrl" | "control" => Key::Control,
        "shift" => Key::Shift,
        "super" | "cmd" | "meta" | "win" => Key::Meta,
        "enter" | "return" => Key::Return,
        "escape" | "esc" => Key::Escape,
        "tab" => Key::Tab,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => return Err(anyhow!("unknown key '{other}'")),
            }
        }
    };
    Ok(key)
}

pub struct EnigoDriver {
    enigo: Enigo,
}

impl EnigoDriver {
    pub fn new() -> Result<Self> {
        let enigo =
            Enigo::new(&Settings::default()).context("failed to initialize input backend")?;
        Ok(Self { enigo })
    }

    pub fn cursor_position(&self) -> Result<(i32, i32)> {
        Ok(self.enigo.location()?)
    }
}

impl InputDriver for EnigoDriver {
    fn click_at(&mut self, x: i32, y: i32) -> Result<()> {
        self.enigo.move_mouse(x, y, Coordinate::Abs)?;
        self.enigo.button(Button::Left, Direction::Click)?;
        Ok(())
    }

    fn key_combo(&mut self, keys: &[Key]) -> Result<()> {
        for key in keys {
            self.enigo.key(*key, Direction::Press)?;
        }
        for key in keys.iter().rev() {
            self.enigo.key(*key, Direction::Release)?;
        }
        Ok(())
    }
}
