//! Ingestion boundary: paginated chat sources and the analysis window.
//!
//! The ingestion collaborator produces a lazy, restartable sequence of chat
//! records. [`page_stream`] turns a paged source into a `Stream` that fetches
//! the next page only when the current one drains, so memory stays bounded by
//! page size plus the pipeline's in-flight window, not by total input size.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use futures::stream::{self, Stream};
use serde::Serialize;

use crate::chat::Chat;
use crate::error::Result;

/// The week being analyzed: Monday through Sunday, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnalysisWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl AnalysisWindow {
    /// The full week preceding `today`.
    pub fn previous_week(today: NaiveDate) -> Self {
        let days_since_monday = i64::from(today.weekday().num_days_from_monday());
        let this_monday = today - chrono::Duration::days(days_since_monday);
        Self {
            start: this_monday - chrono::Duration::days(7),
            end: this_monday - chrono::Duration::days(1),
        }
    }
}

impl std::fmt::Display for AnalysisWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A restartable, paginated producer of chat records.
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Fetch up to `limit` chats starting at `offset`. A short (or empty)
    /// page signals the end of the sequence.
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Chat>>;
}

/// In-memory source over a pre-built list, with fetch accounting so tests can
/// assert that consumers pull pages lazily.
pub struct VecSource {
    chats: Vec<Chat>,
    pages_fetched: AtomicUsize,
}

impl VecSource {
    pub fn new(chats: Vec<Chat>) -> Self {
        Self {
            chats,
            pages_fetched: AtomicUsize::new(0),
        }
    }

    /// Number of `fetch_page` calls served so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatSource for VecSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Chat>> {
        self.pages_fetched.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .chats
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

struct PageState<'a, S: ?Sized> {
    source: &'a S,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<Chat>,
    done: bool,
}

/// Stream chats from a paginated source, one page at a time.
///
/// Each chat has its message-ordering invariant restored before it is
/// yielded. A fetch error ends the stream after logging; partially consumed
/// input is safe because successful chats are checkpointed.
pub fn page_stream<S>(source: &S, page_size: usize) -> impl Stream<Item = Chat> + Send + '_
where
    S: ChatSource + ?Sized,
{
    let page_size = page_size.max(1);
    stream::unfold(
        PageState {
            source,
            page_size,
            offset: 0,
            buffer: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(mut chat) = state.buffer.pop_front() {
                    chat.sort_messages();
                    return Some((chat, state));
                }
                if state.done {
                    return None;
                }

                match state.source.fetch_page(state.offset, state.page_size).await {
                    Ok(page) => {
                        if page.len() < state.page_size {
                            state.done = true;
                        }
                        state.offset += page.len();
                        if page.is_empty() {
                            return None;
                        }
                        state.buffer = page.into();
                    }
                    Err(e) => {
                        tracing::error!(offset = state.offset, error = %e, "page fetch failed, ending stream");
                        return None;
                    }
                }
            }
        },
    )
}

/// Load chats from a JSON array, skipping records that fail validation.
pub fn load_chats_from_json<R: Read>(reader: R) -> Result<Vec<Chat>> {
    let items: Vec<serde_json::Value> = serde_json::from_reader(reader)?;

    let mut chats = Vec::with_capacity(items.len());
    let mut errors = 0usize;
    for item in items {
        let id = item
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        match serde_json::from_value::<Chat>(item) {
            Ok(mut chat) => {
                chat.sort_messages();
                chats.push(chat);
            }
            Err(e) => {
                errors += 1;
                tracing::warn!(chat_id = %id, error = %e, "skipping unparseable chat");
            }
        }
    }

    if errors > 0 {
        tracing::warn!(parsed = chats.len(), skipped = errors, "ingestion finished with skips");
    }
    Ok(chats)
}
