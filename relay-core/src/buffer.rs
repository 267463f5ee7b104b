use crate::fence;
use std::borrow::Cow;
use std::time::Duration;
use tokio::time::Instant;

/// Accumulated text for one generation plus the bookkeeping that decides when
/// the next push is due.
///
/// Lengths are in chars. `accumulated` only ever grows.
#[derive(Debug)]
pub struct StreamBuffer {
    accumulated: String,
    char_len: usize,
    fragments: usize,
    last_pushed_len: usize,
    last_pushed_display_len: usize,
    last_push_at: Instant,
    size_threshold: usize,
    time_threshold: Duration,
    flush_requested: bool,
}

impl StreamBuffer {
    /// `started_at` seeds the time trigger, so the first push can be time-due.
    pub fn new(size_threshold: usize, time_threshold: Duration, started_at: Instant) -> Self {
        Self {
            accumulated: String::new(),
            char_len: 0,
            fragments: 0,
            last_pushed_len: 0,
            last_pushed_display_len: 0,
            last_push_at: started_at,
            size_threshold,
            time_threshold,
            flush_requested: false,
        }
    }

    pub fn append(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.accumulated.push_str(fragment);
        self.char_len += fragment.chars().count();
        self.fragments += 1;
    }

    pub fn due(&self, now: Instant) -> bool {
        let pending = self.unpushed_chars();
        if pending == 0 {
            return false;
        }
        self.flush_requested
            || pending >= self.size_threshold
            || now.saturating_duration_since(self.last_push_at) >= self.time_threshold
    }

    /// Display-safe rendering of everything accumulated so far.
    pub fn snapshot(&self) -> Cow<'_, str> {
        fence::balance(&self.accumulated)
    }

    /// Records a successful push of the current snapshot.
    pub fn mark_pushed(&mut self, now: Instant, display_len: usize) {
        self.last_pushed_len = self.char_len;
        self.last_pushed_display_len = display_len;
        self.last_push_at = now;
    }

    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    /// Instant at which the time trigger fires for the pending text, if any.
    pub fn time_due_at(&self) -> Option<Instant> {
        (self.unpushed_chars() > 0).then(|| self.last_push_at + self.time_threshold)
    }

    pub fn is_size_due(&self) -> bool {
        let pending = self.unpushed_chars();
        pending > 0 && pending >= self.size_threshold
    }

    pub fn unpushed_chars(&self) -> usize {
        self.char_len - self.last_pushed_len
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn into_text(self) -> String {
        self.accumulated
    }

    pub fn len(&self) -> usize {
        self.char_len
    }

    pub fn is_empty(&self) -> bool {
        self.char_len == 0
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn last_pushed_len(&self) -> usize {
        self.last_pushed_len
    }

    pub fn last_pushed_display_len(&self) -> usize {
        self.last_pushed_display_len
    }

    pub fn last_push_at(&self) -> Instant {
        self.last_push_at
    }
}
