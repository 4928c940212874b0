// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{Mutex, atomic::AtomicBool, atomic::Ordering},
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

use crate::{
    api::error::{Result, SessionError},
    counters::Counters,
    session::CapturedTime,
};

/// Window during which every data arrival immediately re-evaluates the
/// predicate; after that arrivals are accumulated until a quiet period.
pub const QUICK_COMMAND_RUNTIME: Duration = Duration::from_secs(1);
/// Quiet period that ends an accumulation burst in the slow phase.
pub const COMMAND_DATA_TIMEOUT: Duration = Duration::from_secs(1);
/// Hard cap on buffered, unmatched device output.
pub const BUFFER_LIMIT: usize = 100 * (1 << 20);

/// Result of a regex read: the bytes before the match, the matched bytes,
/// and the named groups. All three are detached from the read buffer, so
/// they stay valid while the stream keeps feeding.
#[derive(Debug, Clone)]
pub struct ResponseMatch {
    pub data: Bytes,
    pub matched: Bytes,
    pub groups: HashMap<String, Bytes>,
}

impl ResponseMatch {
    pub fn group(&self, name: &str) -> Option<&[u8]> {
        self.groups.get(name).map(|b| b.as_ref())
    }
}

struct Inner {
    buf: BytesMut,
    eof: bool,
    generation: u64,
    last_feed: Option<Instant>,
}

enum WaitOutcome<T> {
    Matched(T),
    Eof,
}

/// A reader for command responses.
///
/// The transport feed task appends bytes; consumers wait for a predicate
/// (normally a prompt regex) over the buffered data. Time the bytes spend
/// in flight between a wait and their arrival is charged to the session's
/// captured-time accumulator.
pub struct StreamReader {
    inner: Mutex<Inner>,
    notify: Notify,
    limit: usize,
    captured: Arc<CapturedTime>,
    /// Feed-interval timing only counts once the transport is fully up, so
    /// connection establishment is not double-charged.
    timing_enabled: AtomicBool,
    counters: Arc<Counters>,
}

impl StreamReader {
    pub fn new(limit: usize, captured: Arc<CapturedTime>, counters: Arc<Counters>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: BytesMut::new(),
                eof: false,
                generation: 0,
                last_feed: None,
            }),
            notify: Notify::new(),
            limit,
            captured,
            timing_enabled: AtomicBool::new(false),
            counters,
        }
    }

    pub fn set_timing_enabled(&self, enabled: bool) {
        self.timing_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Appends received bytes and wakes waiters.
    pub fn feed(&self, data: &[u8]) {
        let mut g = self.lock();
        if self.timing_enabled.load(Ordering::Relaxed) {
            let now = Instant::now();
            if let Some(prev) = g.last_feed {
                self.captured.add(now.saturating_duration_since(prev));
            }
            g.last_feed = Some(now);
        }
        g.buf.extend_from_slice(data);
        g.generation = g.generation.wrapping_add(1);
        drop(g);
        self.notify.notify_waiters();
    }

    /// Marks end of stream and wakes waiters.
    pub fn feed_eof(&self) {
        let mut g = self.lock();
        g.eof = true;
        g.generation = g.generation.wrapping_add(1);
        drop(g);
        self.notify.notify_waiters();
    }

    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    /// Returns and removes all buffered bytes. Typically used before a new
    /// command to make sure the stream is in a sane state.
    pub fn drain(&self) -> Bytes {
        let mut g = self.lock();
        let len = g.buf.len();
        g.buf.split_to(len).freeze()
    }

    /// Reads data until `regex` matches. The search can be restricted to the
    /// trailing `tail_window` bytes, since prompts appear at the end of the
    /// received text.
    ///
    /// At EOF without a match, the full remaining buffer is returned with an
    /// empty match.
    pub async fn readuntil_re(
        &self,
        regex: &Regex,
        timeout: Option<Duration>,
        tail_window: Option<usize>,
    ) -> Result<ResponseMatch> {
        debug!("readuntil_re: {regex:?}");

        struct Spans {
            beg: usize,
            end: usize,
            groups: Vec<(String, usize, usize)>,
        }

        let names: Vec<&str> = regex.capture_names().flatten().collect();
        let outcome = self
            .wait_for(
                |buf| {
                    let start = tail_window
                        .map(|w| buf.len().saturating_sub(w))
                        .unwrap_or(0);
                    regex.captures_at(buf, start).map(|caps| {
                        let whole = caps.get(0).map(|m| (m.start(), m.end()));
                        let (beg, end) = whole.unwrap_or((0, 0));
                        Spans {
                            beg,
                            end,
                            groups: names
                                .iter()
                                .filter_map(|n| {
                                    caps.name(n).map(|g| (n.to_string(), g.start(), g.end()))
                                })
                                .collect(),
                        }
                    })
                },
                timeout,
            )
            .await?;

        let mut g = self.lock();
        match outcome {
            WaitOutcome::Matched(sp) => {
                // split_to detaches the consumed region, so the slices stay
                // valid after the buffer is fed again.
                let consumed = g.buf.split_to(sp.end).freeze();
                let groups = sp
                    .groups
                    .into_iter()
                    .map(|(name, s, e)| (name, consumed.slice(s..e)))
                    .collect();
                Ok(ResponseMatch {
                    data: consumed.slice(0..sp.beg),
                    matched: consumed.slice(sp.beg..sp.end),
                    groups,
                })
            },
            WaitOutcome::Eof => {
                let len = g.buf.len();
                Ok(ResponseMatch {
                    data: g.buf.split_to(len).freeze(),
                    matched: Bytes::new(),
                    groups: HashMap::new(),
                })
            },
        }
    }

    /// Waits for `predicate` to return a value over the buffered bytes.
    ///
    /// Two phases govern the wait: during the first second each arrival
    /// re-evaluates immediately; afterwards arrivals accumulate until a
    /// second of silence. An overall `timeout` bounds the whole wait to keep
    /// slow drips from re-running the regex forever.
    async fn wait_for<T>(
        &self,
        mut predicate: impl FnMut(&[u8]) -> Option<T>,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome<T>> {
        let start = Instant::now();
        {
            // Reference point for the first feed-interval measurement.
            let mut g = self.lock();
            if self.timing_enabled.load(Ordering::Relaxed) {
                g.last_feed = Some(start);
            }
        }

        loop {
            let mut seen_gen;
            {
                let mut g = self.lock();
                if let Some(res) = predicate(&g.buf) {
                    g.last_feed = None;
                    return Ok(WaitOutcome::Matched(res));
                }
                if g.buf.len() > self.limit {
                    self.counters.increment("streamreader.overrun");
                    return Err(SessionError::stream_reader(format!(
                        "Reader buffer overrun: {}: {}",
                        g.buf.len(),
                        self.limit
                    )));
                }
                if g.eof {
                    g.last_feed = None;
                    return Ok(WaitOutcome::Eof);
                }
                debug!(
                    "match failed in: {}: {}",
                    g.buf.len(),
                    String::from_utf8_lossy(
                        &g.buf[g.buf.len().saturating_sub(100)..]
                    )
                );
                seen_gen = g.generation;
            }

            let elapsed = start.elapsed();
            if let Some(t) = timeout
                && elapsed >= t
            {
                return Err(SessionError::command_timeout(
                    "Timeout while matching regex against buffered device output",
                ));
            }
            self.counters.increment("streamreader.wait_for_retry");

            if elapsed > QUICK_COMMAND_RUNTIME {
                // Slow phase: keep absorbing data until the device goes
                // quiet, then try the match again.
                loop {
                    match self.wait_data(seen_gen, Some(COMMAND_DATA_TIMEOUT)).await {
                        Some(new_gen) => {
                            seen_gen = new_gen;
                            if let Some(t) = timeout
                                && start.elapsed() >= t
                            {
                                break;
                            }
                        },
                        None => break,
                    }
                }
            } else {
                // Quick phase: re-evaluate on the first arrival.
                let remaining = timeout.map(|t| t.saturating_sub(start.elapsed()));
                self.wait_data(seen_gen, remaining).await;
            }
        }
    }

    /// Waits for the buffer generation to move past `seen_gen`. Returns the
    /// new generation, or `None` on timeout.
    async fn wait_data(&self, seen_gen: u64, timeout: Option<Duration>) -> Option<u64> {
        loop {
            let notified = self.notify.notified();
            {
                let g = self.lock();
                if g.generation != seen_gen {
                    return Some(g.generation);
                }
            }
            match timeout {
                Some(t) => {
                    if tokio::time::timeout(t, notified).await.is_err() {
                        return None;
                    }
                },
                None => notified.await,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
