use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use log::{debug, warn};

use crate::rules::{parse_tokens, RuleSource, SourceKind};

use super::TokenCache;

/// Watches a plain-text allow list, one token per line.
///
/// A missing file reads as an empty list, not an error, so deleting the file
/// is how a user turns this source off.
pub struct AllowFileSource {
    path: PathBuf,
    cache: TokenCache,
    last_modified: Option<SystemTime>,
}

impl AllowFileSource {
    pub fn new(path: PathBuf, refresh_interval: Duration) -> Self {
        Self {
            path,
            cache: TokenCache::new(refresh_interval),
            last_modified: None,
        }
    }

    /// Rereads the file when the cache aged out or the mtime moved.
    pub fn refresh_if_stale(&mut self) {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if !self.cache.is_stale() && modified == self.last_modified {
            return;
        }
        self.last_modified = modified;

        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let tokens = parse_tokens(&contents);
                debug!("allow list {} -> {} token(s)", self.path.display(), tokens.len());
                self.cache.store(tokens);
            }
            Err(err) => {
                if self.path.exists() {
                    warn!("failed to read allow list {}: {err}", self.path.display());
                }
                self.cache.store(HashSet::new());
            }
        }
    }
}

impl RuleSource for AllowFileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::AllowFile
    }

    fn current_tokens(&self) -> Option<HashSet<String>> {
        self.cache.current()
    }
}
