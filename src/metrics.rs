//! Operational timing metrics computed from chat records.
//!
//! Pure functions, no I/O. Two headline numbers per chat:
//! - *wait time*: mean elapsed time between a customer message and the next
//!   human agent response, counted only for responses sent inside business
//!   hours;
//! - *handling time*: elapsed time between the chat's first and last message.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};
use serde::Serialize;

use crate::chat::Chat;

/// Business-hours window used when counting agent response times.
///
/// Responses sent outside these hours are excluded from wait-time statistics
/// so overnight gaps do not skew the averages.
#[derive(Debug, Clone)]
pub struct BusinessHours {
    offset: FixedOffset,
    weekday_open: NaiveTime,
    weekday_close: NaiveTime,
    friday_close: NaiveTime,
}

impl BusinessHours {
    pub fn new(
        offset: FixedOffset,
        weekday_open: NaiveTime,
        weekday_close: NaiveTime,
        friday_close: NaiveTime,
    ) -> Self {
        Self {
            offset,
            weekday_open,
            weekday_close,
            friday_close,
        }
    }

    /// Whether the instant falls inside business hours.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset);
        let time = local.time();
        match local.weekday() {
            Weekday::Sat | Weekday::Sun => false,
            Weekday::Fri => time >= self.weekday_open && time <= self.friday_close,
            _ => time >= self.weekday_open && time <= self.weekday_close,
        }
    }
}

impl Default for BusinessHours {
    /// Mon-Thu 08:00-18:00, Fri 08:00-17:00, at UTC-3.
    fn default() -> Self {
        Self {
            offset: FixedOffset::west_opt(3 * 3600).expect("UTC-3 is a valid offset"),
            weekday_open: NaiveTime::from_hms_opt(8, 0, 0).expect("08:00 is a valid time"),
            weekday_close: NaiveTime::from_hms_opt(18, 0, 0).expect("18:00 is a valid time"),
            friday_close: NaiveTime::from_hms_opt(17, 0, 0).expect("17:00 is a valid time"),
        }
    }
}

/// Timing statistics for a single chat.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChatTiming {
    /// Mean customer-to-agent response delay within business hours.
    /// `None` when the chat contains no qualifying agent responses.
    pub wait_time: Option<Duration>,
    /// First message to last message.
    pub handling_time: Duration,
    /// Number of agent responses that entered the wait-time average.
    pub response_count: u32,
}

/// Compute wait and handling time for one chat.
///
/// Messages are expected in timestamp order (the ingestion invariant).
pub fn chat_timing(chat: &Chat, hours: &BusinessHours) -> ChatTiming {
    let (Some(first), Some(last)) = (chat.messages.first(), chat.messages.last()) else {
        return ChatTiming::default();
    };

    let handling_time = (last.sent_at - first.sent_at)
        .to_std()
        .unwrap_or(Duration::ZERO);

    let mut total_wait = Duration::ZERO;
    let mut response_count = 0u32;
    let mut prev: Option<&crate::chat::Message> = None;

    for msg in &chat.messages {
        if let Some(p) = prev {
            // An agent response to a customer message, inside business hours
            if msg.from_agent() && !p.from_agent() && hours.contains(msg.sent_at) {
                if let Ok(delta) = (msg.sent_at - p.sent_at).to_std() {
                    total_wait += delta;
                    response_count += 1;
                }
            }
        }
        prev = Some(msg);
    }

    let wait_time = (response_count > 0).then(|| total_wait / response_count);

    ChatTiming {
        wait_time,
        handling_time,
        response_count,
    }
}

/// Per-agent performance summary.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPerformance {
    pub agent: String,
    pub chats: u64,
    /// Response-weighted mean wait time in seconds
    pub avg_wait_secs: f64,
    /// Mean handling time in seconds
    pub avg_handling_secs: f64,
}

/// Aggregate timing metrics per agent, sorted fastest responder first.
///
/// Chats without an assigned agent are grouped under "Unassigned".
pub fn agent_performance(chats: &[Chat], hours: &BusinessHours) -> Vec<AgentPerformance> {
    struct Acc {
        chats: u64,
        total_wait: Duration,
        responses: u64,
        total_handling: Duration,
    }

    let mut by_agent: HashMap<String, Acc> = HashMap::new();

    for chat in chats {
        let timing = chat_timing(chat, hours);
        let agent = chat.agent_name().unwrap_or("Unassigned").to_string();
        let acc = by_agent.entry(agent).or_insert(Acc {
            chats: 0,
            total_wait: Duration::ZERO,
            responses: 0,
            total_handling: Duration::ZERO,
        });
        acc.chats += 1;
        acc.total_handling += timing.handling_time;
        if let Some(wait) = timing.wait_time {
            acc.total_wait += wait * timing.response_count;
            acc.responses += u64::from(timing.response_count);
        }
    }

    let mut summary: Vec<AgentPerformance> = by_agent
        .into_iter()
        .map(|(agent, acc)| AgentPerformance {
            agent,
            chats: acc.chats,
            avg_wait_secs: if acc.responses > 0 {
                acc.total_wait.as_secs_f64() / acc.responses as f64
            } else {
                0.0
            },
            avg_handling_secs: if acc.chats > 0 {
                acc.total_handling.as_secs_f64() / acc.chats as f64
            } else {
                0.0
            },
        })
        .collect();

    summary.sort_by(|a, b| {
        a.avg_wait_secs
            .partial_cmp(&b.avg_wait_secs)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    summary
}

/// Message volume by weekday and hour: `heatmap[weekday][hour]`, weekday 0 =
/// Monday, hours in the business-hours offset.
pub fn message_heatmap(chats: &[Chat], hours: &BusinessHours) -> [[u64; 24]; 7] {
    let mut grid = [[0u64; 24]; 7];
    for chat in chats {
        for msg in &chat.messages {
            let local = msg.sent_at.with_timezone(&hours.offset);
            let day = local.weekday().num_days_from_monday() as usize;
            let hour = local.hour() as usize;
            grid[day][hour] += 1;
        }
    }
    grid
}

/// Tag frequency across chats.
pub fn tag_frequency(chats: &[Chat]) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for chat in chats {
        for tag in chat.tag_names() {
            *counts.entry(tag).or_insert(0) += 1;
        }
    }
    counts
}
