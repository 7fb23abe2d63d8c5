use std::sync::{
    mpsc::{self, Sender},
    Arc, Mutex,
};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use rodio::source::{SineWave, Source};
use rodio::{OutputStream, Sink};

const BEEP_FREQ_HZ: f32 = 800.0;
const BEEP_DURATION_MS: u64 = 150;
const BEEP_GAIN: f32 = 0.20;

enum AlertCommand {
    Beep,
}

/// Plays the short skip-alert tone. Fire-and-forget: a machine with no
/// audio output logs once and stays quiet.
#[derive(Clone)]
pub struct AlertHandle {
    tx: Arc<Mutex<Option<Sender<AlertCommand>>>>,
}

impl AlertHandle {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn beep(&self) {
        match self.ensure_thread() {
            Ok(tx) => {
                let _ = tx.send(AlertCommand::Beep);
            }
            Err(err) => debug!("Skipping alert beep: {err}"),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AlertCommand>> {
        let mut guard = self
            .tx
            .lock()
            .map_err(|_| anyhow!("alert channel lock poisoned"))?;
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<AlertCommand>();

        // Dedicated thread holds the non-Send rodio objects.
        thread::Builder::new()
            .name("permitwatch-alert".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("No audio output available, alerts disabled: {err}");
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(err) => {
                        warn!("Failed to create audio sink, alerts disabled: {err}");
                        return;
                    }
                };

                while let Ok(command) = rx.recv() {
                    match command {
                        AlertCommand::Beep => {
                            let tone = SineWave::new(BEEP_FREQ_HZ)
                                .take_duration(Duration::from_millis(BEEP_DURATION_MS))
                                .amplify(BEEP_GAIN);
                            sink.append(tone);
                        }
                    }
                }
            })
            .map_err(|err| anyhow!("failed to spawn alert thread: {err}"))?;

        let tx_clone = tx.clone();
        *guard = Some(tx);
        Ok(tx_clone)
    }
}
