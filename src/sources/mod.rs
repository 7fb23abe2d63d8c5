pub mod allow_file;
pub mod chat_ocr;

pub use allow_file::AllowFileSource;
pub use chat_ocr::ChatOcrSource;

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Cached token set for one dynamic source.
///
/// `current` only surfaces tokens that are both fresh (younger than the
/// refresh interval) and non-empty; everything else reads as "nothing to
/// say" so the resolver moves on to the next source.
#[derive(Debug)]
pub struct TokenCache {
    tokens: HashSet<String>,
    refreshed_at: Option<Instant>,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: HashSet::new(),
            refreshed_at: None,
            ttl,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self.refreshed_at {
            None => true,
            Some(at) => at.elapsed() >= self.ttl,
        }
    }

    pub fn store(&mut self, tokens: HashSet<String>) {
        self.tokens = tokens;
        self.refreshed_at = Some(Instant::now());
    }

    /// Restamps freshness without replacing content, for the case where the
    /// upstream data was checked and found unchanged.
    pub fn touch(&mut self) {
        self.refreshed_at = Some(Instant::now());
    }

    pub fn current(&self) -> Option<HashSet<String>> {
        if self.is_stale() || self.tokens.is_empty() {
            None
        } else {
            Some(self.tokens.clone())
        }
    }
}
