use std::collections::HashSet;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, RgbaImage};
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use log::{debug, warn};
use xcap::Window;

use crate::ocr::OcrEngine;
use crate::rules::{parse_tokens, RuleSource, SourceKind};

use super::TokenCache;

// Hash distances below this count as "window unchanged"; the cached tokens
// are restamped instead of re-running recognition.
const PHASH_CHANGE_THRESHOLD: u32 = 2;

/// Reads the allow list a chat/agent window displays, via screen OCR.
///
/// A perceptual hash of the captured window gates the OCR call, since
/// recognition costs far more than a capture.
pub struct ChatOcrSource {
    window_title: String,
    engine: Option<OcrEngine>,
    cache: TokenCache,
    last_hash: Option<String>,
}

impl ChatOcrSource {
    /// `engine` None means no OCR backend exists on this machine; the source
    /// then permanently reads as silent.
    pub fn new(window_title: String, refresh_interval: Duration, engine: Option<OcrEngine>) -> Self {
        Self {
            window_title,
            engine,
            cache: TokenCache::new(refresh_interval),
            last_hash: None,
        }
    }

    /// Capture and recognition pass; call from a blocking context.
    pub fn refresh_if_stale(&mut self) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        if !self.cache.is_stale() {
            return;
        }

        let png_bytes = match self.capture_window() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("no window matching '{}' on screen", self.window_title);
                self.cache.store(HashSet::new());
                return;
            }
            Err(err) => {
                // Cache left stale; the source reads as silent until a
                // capture succeeds again.
                warn!("chat window capture failed: {err:#}");
                return;
            }
        };

        let hash = match frame_hash(&png_bytes) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("chat frame hash failed: {err:#}");
                return;
            }
        };

        if let Some(previous) = &self.last_hash {
            if hash_distance(previous, &hash) < PHASH_CHANGE_THRESHOLD {
                self.cache.touch();
                return;
            }
        }

        match engine.extract_text(&png_bytes) {
            Ok(text) => {
                let tokens = parse_tokens(&text);
                debug!("chat ocr -> {} token(s)", tokens.len());
                self.cache.store(tokens);
                self.last_hash = Some(hash);
            }
            Err(err) => warn!("chat ocr failed: {err:#}"),
        }
    }

    fn capture_window(&self) -> Result<Option<Vec<u8>>> {
        let needle = self.window_title.to_lowercase();
        let windows = Window::all().context("failed to enumerate windows")?;
        for window in windows {
            let Ok(title) = window.title() else { continue };
            if !title.to_lowercase().contains(&needle) {
                continue;
            }
            if window.is_minimized().unwrap_or(false) {
                continue;
            }
            let image = window
                .capture_image()
                .context("failed to capture chat window")?;
            return encode_png(&image).map(Some);
        }
        Ok(None)
    }
}

impl RuleSource for ChatOcrSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ChatOcr
    }

    fn current_tokens(&self) -> Option<HashSet<String>> {
        if self.engine.is_none() {
            return None;
        }
        self.cache.current()
    }
}

fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode window capture")?;
    Ok(bytes)
}

fn frame_hash(png_bytes: &[u8]) -> Result<String> {
    let img = image::load_from_memory_with_format(png_bytes, ImageFormat::Png)?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();
    Ok(hasher.hash_image(&img).to_base64())
}

fn hash_distance(lhs: &str, rhs: &str) -> u32 {
    let Ok(h1) = ImageHash::<Vec<u8>>::from_base64(lhs) else {
        return u32::MAX;
    };
    let Ok(h2) = ImageHash::<Vec<u8>>::from_base64(rhs) else {
        return u32::MAX;
    };
    h1.dist(&h2)
}
