//! Notification events and webhook delivery.
//!
//! Core components push events through a cheap `Notifier` handle; a single
//! dispatcher task renders them into chat-webhook payloads and posts them.
//! Delivery failures are logged here and never reach the loops.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Events produced by a precise-tracker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Started {
        base_id: String,
    },
    /// First value ever observed across the id family.
    Baseline {
        probe_id: String,
        name: String,
        experience: i64,
    },
    Increase {
        probe_id: String,
        name: String,
        delta: i64,
        total: i64,
        elapsed: Duration,
    },
    Interrupted,
    Error {
        message: String,
    },
    Completed {
        increases: u32,
    },
}

/// One notification to deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    XpChange {
        subject_id: String,
        before: i64,
        after: i64,
        name: String,
        level: u32,
        subscribers: Vec<u64>,
    },
    LevelUp {
        subject_id: String,
        name: String,
        prev_level: u32,
        new_level: u32,
        subscribers: Vec<u64>,
    },
    Tracker {
        context: u64,
        event: TrackerEvent,
    },
}

/// The dispatcher task is gone; nothing can be delivered anymore.
#[derive(Debug, Error)]
#[error("notification dispatcher is no longer running")]
pub struct DispatcherClosed;

/// Sender half handed to the loops.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn send(&self, notification: Notification) -> Result<(), DispatcherClosed> {
        self.tx.send(notification).map_err(|_| DispatcherClosed)
    }

    pub fn tracker(&self, context: u64, event: TrackerEvent) -> Result<(), DispatcherClosed> {
        self.send(Notification::Tracker { context, event })
    }
}

/// Create the notifier handle and the receiver the dispatcher drains.
pub fn channel() -> (Notifier, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Notifier { tx }, rx)
}

const COLOR_GAIN: u32 = 0x2ecc71;
const COLOR_LOSS: u32 = 0xe74c3c;
const COLOR_NEUTRAL: u32 = 0x5865f2;
const COLOR_LEVEL_UP: u32 = 0xf1c40f;

/// Posts rendered notifications to a fixed chat webhook.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Probe the webhook once. The reconciliation loop refuses to start
    /// until this succeeds.
    pub async fn resolve(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            anyhow::bail!("webhook_url is not configured");
        }
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook probe returned {}", resp.status());
        }
        info!("Notification webhook resolved");
        Ok(())
    }

    /// Drain the event channel until every sender is gone.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Notification>) {
        while let Some(notification) = rx.recv().await {
            if let Err(e) = self.deliver(&notification).await {
                warn!("Notification delivery failed: {}", e);
            }
        }
        info!("Notification dispatcher stopped");
    }

    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let payload = render(notification);
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook returned {}", resp.status());
        }
        Ok(())
    }
}

/// Build the webhook payload for one notification.
pub fn render(notification: &Notification) -> Value {
    match notification {
        Notification::XpChange {
            subject_id,
            before,
            after,
            name,
            level,
            subscribers,
        } => {
            let delta = after - before;
            let (arrow, color) = if delta > 0 {
                ("\u{2b06}\u{fe0f}", COLOR_GAIN)
            } else if delta < 0 {
                ("\u{2b07}\u{fe0f}", COLOR_LOSS)
            } else {
                ("\u{27a1}\u{fe0f}", COLOR_NEUTRAL)
            };

            json!({
                "content": mentions(subscribers),
                "embeds": [{
                    "title": format!("XP change {}", arrow),
                    "color": color,
                    "fields": [
                        { "name": "Name", "value": name, "inline": true },
                        { "name": "ID", "value": format!("`{}`", subject_id), "inline": true },
                        { "name": "Level", "value": level.to_string(), "inline": true },
                        { "name": "XP before", "value": fmt_int(*before), "inline": true },
                        { "name": "XP after", "value": fmt_int(*after), "inline": true },
                        { "name": "Delta", "value": fmt_delta(delta), "inline": true },
                    ],
                }],
            })
        }
        Notification::LevelUp {
            subject_id,
            name,
            prev_level,
            new_level,
            subscribers,
        } => json!({
            "content": mentions(subscribers),
            "embeds": [{
                "title": "\u{1f389} Level up",
                "description": format!(
                    "**{}** (`{}`) goes **{} \u{279c} {}**",
                    name, subject_id, prev_level, new_level
                ),
                "color": COLOR_LEVEL_UP,
            }],
        }),
        Notification::Tracker { event, .. } => json!({ "content": tracker_line(event) }),
    }
}

fn tracker_line(event: &TrackerEvent) -> String {
    match event {
        TrackerEvent::Started { base_id } => {
            format!("\u{1f50e} Precise tracking started for base `{}`", base_id)
        }
        TrackerEvent::Baseline {
            probe_id,
            name,
            experience,
        } => format!(
            "\u{1f4cd} Baseline: **{}** (`{}`) at {} XP",
            name,
            probe_id,
            fmt_int(*experience)
        ),
        TrackerEvent::Increase {
            probe_id,
            name,
            delta,
            total,
            elapsed,
        } => format!(
            "\u{2b06}\u{fe0f} **{}** (`{}`) {} XP (now {}) after {}",
            name,
            probe_id,
            fmt_delta(*delta),
            fmt_int(*total),
            fmt_elapsed(*elapsed)
        ),
        TrackerEvent::Interrupted => "\u{23f9}\u{fe0f} Precise tracking interrupted.".to_string(),
        TrackerEvent::Error { message } => {
            format!("\u{26a0}\u{fe0f} Precise tracking aborted: {}", message)
        }
        TrackerEvent::Completed { increases } => format!(
            "\u{1f3c1} Precise tracking finished ({} increase(s) observed).",
            increases
        ),
    }
}

/// Mention line for subscribers, empty when nobody opted in.
fn mentions(subscribers: &[u64]) -> String {
    subscribers
        .iter()
        .map(|id| format!("<@{}>", id))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Thousands grouping with spaces, the format the channel is used to.
fn fmt_int(n: i64) -> String {
    let negative = n < 0;
    let digits = n.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(c);
    }
    if negative {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

fn fmt_delta(delta: i64) -> String {
    if delta >= 0 {
        format!("+{}", fmt_int(delta))
    } else {
        fmt_int(delta)
    }
}

fn fmt_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
