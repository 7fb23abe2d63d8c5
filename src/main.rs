use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use permitwatch::alert::AlertHandle;
use permitwatch::buttons::{self, ButtonAction, TemplateStore};
use permitwatch::config::{ButtonEntry, ConfigStore};
use permitwatch::dispatch::Dispatcher;
use permitwatch::events;
use permitwatch::hotkeys::HotkeyListener;
use permitwatch::input::{self, EnigoDriver};
use permitwatch::journal::{self, Journal};
use permitwatch::monitor::{MonitorContext, MonitorController};
use permitwatch::ocr::OcrEngine;
use permitwatch::scanner::{self, FrameSource, PrimaryMonitorSource, Scanner};
use permitwatch::sources::{AllowFileSource, ChatOcrSource};

#[derive(Parser)]
#[command(
    name = "permitwatch",
    version,
    about = "Watches the screen for known dialog buttons and answers them automatically"
)]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, default_value = "permitwatch.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watches the screen and answers detected buttons.
    Run,
    /// Global hotkeys only, no screen scanning.
    Hotkeys,
    /// Prints the configured buttons and settings.
    Show,
    /// Changes the default action for a button.
    Set {
        /// Button id to change.
        id: String,
        /// approve, deny or skip.
        action: ButtonAction,
    },
    /// Adds a button definition to the config.
    Add {
        /// New button id.
        id: String,
        /// Template image file name under the assets dir (defaults to "<id>.png").
        #[arg(long)]
        image: Option<String>,
        #[arg(long, default_value = "skip")]
        action: ButtonAction,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Captures a template image around the mouse cursor.
    Capture {
        /// Output file name under the assets dir.
        file: String,
        #[arg(long, default_value_t = 100)]
        width: u32,
        #[arg(long, default_value_t = 30)]
        height: u32,
        /// Seconds to wait before capturing.
        #[arg(long, default_value_t = 3)]
        delay: u64,
    },
    /// Shows recent journal entries.
    History {
        /// Number of entries to display.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run => cmd_run(&cli.config, true).await,
        Command::Hotkeys => cmd_run(&cli.config, false).await,
        Command::Show => cmd_show(&cli.config),
        Command::Set { id, action } => cmd_set(&cli.config, &id, action),
        Command::Add { id, image, action, description } => {
            cmd_add(&cli.config, &id, image, action, &description)
        }
        Command::Capture { file, width, height, delay } => {
            cmd_capture(&cli.config, &file, width, height, delay).await
        }
        Command::History { limit } => cmd_history(&cli.config, limit).await,
    }
}

async fn cmd_run(config_path: &Path, with_scan: bool) -> Result<()> {
    let config = Arc::new(ConfigStore::open(config_path)?);
    let cfg = config.config();

    let store = TemplateStore::load(&cfg, config.assets_dir());
    for button in store.all() {
        info!(
            "Watching '{}': {} by default{}",
            button.id,
            button.default_action.as_str(),
            if button.template.is_some() { "" } else { " (no template image)" }
        );
    }
    if with_scan && store.loaded_count() == 0 {
        warn!("No template images loaded; scanning will never match. Use 'permitwatch capture' to create some.");
    }
    let store = Arc::new(RwLock::new(store));

    let run_id = Uuid::new_v4().to_string();
    let journal = if cfg.settings.log_actions {
        match Journal::open(journal_path(config.path())) {
            Ok(journal) => {
                journal.begin_run(&run_id, Utc::now()).await?;
                Some(journal)
            }
            Err(err) => {
                warn!("Journal disabled: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let (events_tx, events_rx) = events::channel();
    let journal_task = tokio::spawn(journal::consume(events_rx, journal.clone(), run_id.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        input::shared(EnigoDriver::new()?),
        AlertHandle::new(),
        events_tx,
    )?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping session");
                cancel.cancel();
            }
        });
    }

    let mut controller = MonitorController::new();
    if with_scan {
        let engine = if cfg.chat_input_mode.enabled {
            let engine = OcrEngine::detect();
            if engine.is_none() {
                warn!("tesseract not found; chat window reading stays disabled for this session");
            }
            engine
        } else {
            None
        };

        let ctx = MonitorContext {
            config: Arc::clone(&config),
            store: Arc::clone(&store),
            dispatcher: Arc::clone(&dispatcher),
            scanner: Arc::new(Mutex::new(Scanner::new(PrimaryMonitorSource))),
            allow_file: Arc::new(Mutex::new(AllowFileSource::new(
                PathBuf::from(&cfg.allow_list.path),
                Duration::from_secs_f64(cfg.allow_list.refresh_interval),
            ))),
            chat_ocr: Arc::new(Mutex::new(ChatOcrSource::new(
                cfg.chat_input_mode.window_title.clone(),
                Duration::from_secs_f64(cfg.chat_input_mode.refresh_interval),
                engine,
            ))),
        };
        controller.start(ctx, cancel.clone())?;
        info!(
            "Watching {} button(s) every {:.1}s (run {})",
            store.read().unwrap().len(),
            cfg.settings.check_interval,
            run_id
        );
    } else {
        info!("Hotkey-only mode, no screen scanning (run {run_id})");
    }

    match HotkeyListener::register(&cfg.hotkeys) {
        Ok(listener) => {
            listener
                .run(Arc::clone(&dispatcher), Arc::clone(&config), cancel.clone())
                .await;
        }
        Err(err) if with_scan => {
            // Scanning still works without hotkeys; keep the session up.
            warn!("Global hotkeys unavailable: {err:#}");
            cancel.cancelled().await;
        }
        Err(err) => {
            return Err(err.context("hotkey mode requires working global hotkeys"));
        }
    }

    controller.stop().await?;

    // The dispatcher owns the last event sender; dropping it lets the
    // journal task drain and finish.
    drop(dispatcher);
    let stats = journal_task.await.context("journal task failed to join")?;

    if let Some(journal) = &journal {
        if let Err(err) = journal.finalize_run(&run_id, Utc::now(), stats).await {
            warn!("Failed to finalize run: {err:#}");
        }
    }

    info!(
        "Session finished: {} approved, {} denied, {} skipped, {} failed",
        stats.approved, stats.denied, stats.skipped, stats.failed
    );
    Ok(())
}

fn cmd_show(config_path: &Path) -> Result<()> {
    let config = ConfigStore::open(config_path)?;
    let cfg = config.config();

    println!("Buttons ({}):", cfg.buttons.len());
    for (id, entry) in &cfg.buttons {
        let deny_class = entry
            .deny_class
            .unwrap_or_else(|| buttons::default_deny_class(id));
        let mut line = format!(
            "  {:<20} {:<8} image={} class={}",
            id,
            entry.action.as_str(),
            entry.image,
            if deny_class { "deny" } else { "approve" }
        );
        if !entry.aliases.is_empty() {
            line.push_str(&format!(" aliases={}", entry.aliases.join(",")));
        }
        if !entry.description.is_empty() {
            line.push_str(&format!("  # {}", entry.description));
        }
        println!("{line}");
    }

    let settings = &cfg.settings;
    println!();
    println!("Settings:");
    println!("  check_interval      {}s", settings.check_interval);
    println!("  action_delay        {}s", settings.action_delay);
    println!("  cooldown            {}s", settings.cooldown);
    println!("  confidence          {}", settings.confidence);
    println!("  log_actions         {}", settings.log_actions);
    println!("  sound_alert_on_skip {}", settings.sound_alert_on_skip);
    println!();
    println!(
        "Allow list: {} (refresh {}s)",
        cfg.allow_list.path, cfg.allow_list.refresh_interval
    );
    println!(
        "Chat input: {} (window '{}', precedence {}, fallback_to_config {})",
        if cfg.chat_input_mode.enabled { "enabled" } else { "disabled" },
        cfg.chat_input_mode.window_title,
        cfg.chat_input_mode.precedence.as_str(),
        cfg.chat_input_mode.fallback_to_config
    );
    println!(
        "Hotkeys: approve={} deny={} quit={}",
        cfg.hotkeys.approve, cfg.hotkeys.deny, cfg.hotkeys.quit
    );
    Ok(())
}

fn cmd_set(config_path: &Path, id: &str, action: ButtonAction) -> Result<()> {
    let config = ConfigStore::open(config_path)?;
    let cfg = config.config();
    if !cfg.buttons.contains_key(id) {
        let known: Vec<&str> = cfg.buttons.keys().map(String::as_str).collect();
        bail!("unknown button '{id}' (known: {})", known.join(", "));
    }

    config.update(|cfg| {
        if let Some(entry) = cfg.buttons.get_mut(id) {
            entry.action = action;
        }
    })?;

    println!("{id} -> {}", action.as_str());
    Ok(())
}

fn cmd_add(
    config_path: &Path,
    id: &str,
    image: Option<String>,
    action: ButtonAction,
    description: &str,
) -> Result<()> {
    let config = ConfigStore::open(config_path)?;
    if config.config().buttons.contains_key(id) {
        bail!("button '{id}' already exists; use 'set' to change its action");
    }

    let image = image.unwrap_or_else(|| format!("{id}.png"));
    let image_path = config.assets_dir().join(&image);
    if !image_path.exists() {
        warn!(
            "Template image {} does not exist yet; 'permitwatch capture' can create it",
            image_path.display()
        );
    }

    config.update(|cfg| {
        cfg.buttons.insert(
            id.to_string(),
            ButtonEntry {
                image: image.clone(),
                action,
                description: description.to_string(),
                aliases: Vec::new(),
                deny_class: None,
            },
        );
    })?;

    println!("Added '{id}' ({}, image {image})", action.as_str());
    Ok(())
}

async fn cmd_capture(
    config_path: &Path,
    file: &str,
    width: u32,
    height: u32,
    delay: u64,
) -> Result<()> {
    let config = ConfigStore::open(config_path)?;

    println!("Position the mouse over the button to capture.");
    for remaining in (1..=delay).rev() {
        println!("  capturing in {remaining}...");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let target = config.assets_dir().join(file);
    let (saved_path, saved_width, saved_height) =
        tokio::task::spawn_blocking(move || -> Result<(PathBuf, u32, u32)> {
            let driver = EnigoDriver::new()?;
            let (cursor_x, cursor_y) = driver.cursor_position()?;

            let mut frames = PrimaryMonitorSource;
            let (frame, origin) = frames.capture()?;

            // Cursor in frame-local coordinates, clamped to the frame.
            let local_x = (cursor_x - origin.0).clamp(0, frame.width() as i32 - 1) as u32;
            let local_y = (cursor_y - origin.1).clamp(0, frame.height() as i32 - 1) as u32;

            let (patch, _) = scanner::crop_centered(&frame, (local_x, local_y), width, height);
            patch
                .save(&target)
                .with_context(|| format!("failed to save {}", target.display()))?;
            Ok((target, patch.width(), patch.height()))
        })
        .await
        .context("capture worker join failed")??;

    println!("Saved {saved_width}x{saved_height} template to {}", saved_path.display());
    Ok(())
}

async fn cmd_history(config_path: &Path, limit: u32) -> Result<()> {
    let path = journal_path(config_path);
    if !path.exists() {
        println!(
            "No journal at {} (log_actions disabled, or nothing ran yet)",
            path.display()
        );
        return Ok(());
    }

    let journal = Journal::open(path)?;

    if let Some(run) = journal.recent_runs(1).await?.into_iter().next() {
        let stopped = run
            .stopped_at
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "still running".to_string());
        println!(
            "Last run {} (started {}, stopped {}): {} approved, {} denied, {} skipped, {} failed",
            run.id,
            run.started_at.to_rfc3339(),
            stopped,
            run.stats.approved,
            run.stats.denied,
            run.stats.skipped,
            run.stats.failed
        );
        println!();
    }

    let entries = journal.recent_events(limit).await?;
    if entries.is_empty() {
        println!("No recorded events.");
        return Ok(());
    }

    for entry in &entries {
        let confidence = entry
            .confidence
            .map(|value| format!(" conf={value:.3}"))
            .unwrap_or_default();
        let detail = entry
            .detail
            .as_deref()
            .map(|text| format!(" ({text})"))
            .unwrap_or_default();
        println!(
            "{}  {:<10} {:<20} {:<14} {}{}{}",
            entry.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            entry.outcome,
            entry.button_id,
            entry.source,
            entry.action,
            confidence,
            detail
        );
    }
    Ok(())
}

/// The journal lives next to the config file.
fn journal_path(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if parent != Path::new("") => parent.join("permitwatch.sqlite3"),
        _ => PathBuf::from("permitwatch.sqlite3"),
    }
}
