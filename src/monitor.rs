use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::buttons::TemplateStore;
use crate::config::{ConfigStore, SourcePrecedence};
use crate::dispatch::Dispatcher;
use crate::rules::{self, ResolvePolicy, RuleSource};
use crate::scanner::{FrameSource, Scanner};
use crate::sources::{AllowFileSource, ChatOcrSource};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_error, log_info, log_warn};

const TICK_TIMEOUT_SECS: u64 = 10;

/// Everything one scan tick touches.
pub struct MonitorContext<F: FrameSource + 'static> {
    pub config: Arc<ConfigStore>,
    pub store: Arc<RwLock<TemplateStore>>,
    pub dispatcher: Arc<Dispatcher>,
    pub scanner: Arc<Mutex<Scanner<F>>>,
    pub allow_file: Arc<Mutex<AllowFileSource>>,
    pub chat_ocr: Arc<Mutex<ChatOcrSource>>,
}

impl<F: FrameSource + 'static> Clone for MonitorContext<F> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            scanner: Arc::clone(&self.scanner),
            allow_file: Arc::clone(&self.allow_file),
            chat_ocr: Arc::clone(&self.chat_ocr),
        }
    }
}

pub struct MonitorController {
    handle: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl MonitorController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel: None,
        }
    }

    pub fn start<F: FrameSource + 'static>(
        &mut self,
        ctx: MonitorContext<F>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("watcher already active");
        }

        let token_clone = cancel.clone();
        let handle = tokio::spawn(monitor_loop(ctx, token_clone));

        self.handle = Some(handle);
        self.cancel = Some(cancel);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("watcher loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

/// Ticks at `check_interval`. Cancellation is honored at tick
/// boundaries, so an in-flight dispatch always completes.
pub async fn monitor_loop<F: FrameSource + 'static>(
    ctx: MonitorContext<F>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs_f64(ctx.config.config().settings.check_interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cancel.is_cancelled() {
                    break;
                }

                if let Err(err) = run_tick(&ctx).await {
                    log_error!("scan tick failed: {err:?}");
                }
            }
            _ = cancel.cancelled() => {
                log_info!("scan loop shutting down");
                break;
            }
        }
    }
}

async fn run_tick<F: FrameSource + 'static>(ctx: &MonitorContext<F>) -> Result<()> {
    match ctx.config.reload_if_modified() {
        Ok(true) => {
            let cfg = ctx.config.config();
            let fresh = TemplateStore::load(&cfg, ctx.config.assets_dir());
            let mut store = ctx.store.write().unwrap();
            *store = fresh;
            log_info!(
                "Config reloaded: {} buttons, {} templates",
                store.len(),
                store.loaded_count()
            );
        }
        Ok(false) => {}
        Err(err) => log_warn!("config reload failed, keeping previous: {err:#}"),
    }

    let cfg = ctx.config.config();
    let store = Arc::clone(&ctx.store);
    let scanner = Arc::clone(&ctx.scanner);
    let allow_file = Arc::clone(&ctx.allow_file);
    let chat_ocr = Arc::clone(&ctx.chat_ocr);

    // Source refresh, rule resolution and the template scan all block,
    // so the whole read side of the tick runs off the runtime. The
    // timeout covers only this read side; a dispatch, once started,
    // runs to completion.
    let scan = tokio::task::spawn_blocking(move || {
        allow_file.lock().unwrap().refresh_if_stale();
        if cfg.chat_input_mode.enabled {
            chat_ocr.lock().unwrap().refresh_if_stale();
        }

        let allow = allow_file.lock().unwrap();
        let chat = chat_ocr.lock().unwrap();
        let mut sources: Vec<&dyn RuleSource> = Vec::new();
        match cfg.chat_input_mode.precedence {
            SourcePrecedence::ChatFirst => {
                if cfg.chat_input_mode.enabled {
                    sources.push(&*chat);
                }
                sources.push(&*allow);
            }
            SourcePrecedence::FileFirst => {
                sources.push(&*allow);
                if cfg.chat_input_mode.enabled {
                    sources.push(&*chat);
                }
            }
        }

        let policy = ResolvePolicy {
            chat_enabled: cfg.chat_input_mode.enabled,
            fallback_to_config: cfg.chat_input_mode.fallback_to_config,
        };

        let store = store.read().unwrap();
        let rules = rules::resolve(&store, &sources, policy);
        let matches = scanner.lock().unwrap().scan(&store, cfg.settings.confidence);
        (rules, matches)
    });
    let (rules, matches) =
        match tokio::time::timeout(Duration::from_secs(TICK_TIMEOUT_SECS), scan).await {
            Ok(joined) => joined.context("scan worker join failed")?,
            Err(_) => {
                log_warn!("scan tick timeout (> {}s)", TICK_TIMEOUT_SECS);
                return Ok(());
            }
        };

    if !matches.is_empty() {
        log_info!("Detected {} candidate button(s)", matches.len());
    }

    let settings = ctx.config.config().settings;
    ctx.dispatcher.handle_matches(&matches, &rules, &settings).await;

    Ok(())
}
