use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::broadcast;
use tracing::debug;

use crate::market_calendar::ist_rfc3339;

/// Closed set of event kinds crossing the push fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hello,
    FullSnapshot,
    PanelUpdate,
    PanelDiff,
    PanelFull,
    Heartbeat,
    CycleEnd,
    ResyncRequired,
    Bye,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::FullSnapshot => "full_snapshot",
            Self::PanelUpdate => "panel_update",
            Self::PanelDiff => "panel_diff",
            Self::PanelFull => "panel_full",
            Self::Heartbeat => "heartbeat",
            Self::CycleEnd => "cycle_end",
            Self::ResyncRequired => "resync_required",
            Self::Bye => "bye",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Strictly monotonic across all publishers in the process.
    pub id: u64,
    /// Per-kind sequence number.
    pub seq: u64,
    pub kind: EventKind,
    pub ts_ist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coalesce_key: Option<String>,
    pub payload: Value,
}

struct Ring {
    events: VecDeque<Event>,
    next_id: u64,
    seq_by_kind: BTreeMap<EventKind, u64>,
    dropped: BTreeMap<String, u64>,
    last_panel_full_id: Option<u64>,
}

/// Bounded in-memory event ring with monotonic ids. Publishers never
/// block; overflow drops the oldest non-`panel_full` event and `panel_full`
/// entries coalesce per key so the backlog always holds the latest
/// baseline.
pub struct EventBus {
    ring: Mutex<Ring>,
    capacity: usize,
    notify: broadcast::Sender<u64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            ring: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity.min(1_024)),
                next_id: 1,
                seq_by_kind: BTreeMap::new(),
                dropped: BTreeMap::new(),
                last_panel_full_id: None,
            }),
            capacity: capacity.max(8),
            notify,
        }
    }

    pub fn publish(&self, kind: EventKind, payload: Value, coalesce_key: Option<String>) -> u64 {
        let id = {
            let mut ring = self.ring.lock();
            let id = ring.next_id;
            ring.next_id += 1;
            let seq = {
                let seq = ring.seq_by_kind.entry(kind).or_insert(0);
                *seq += 1;
                *seq
            };

            if kind == EventKind::PanelFull {
                ring.last_panel_full_id = Some(id);
                if let Some(key) = &coalesce_key {
                    // Retain only the latest full per coalesce key.
                    let stale: Vec<usize> = ring
                        .events
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| {
                            e.kind == EventKind::PanelFull && e.coalesce_key.as_ref() == Some(key)
                        })
                        .map(|(i, _)| i)
                        .collect();
                    for i in stale.into_iter().rev() {
                        ring.events.remove(i);
                        *ring.dropped.entry("coalesced".to_string()).or_default() += 1;
                    }
                }
            }

            ring.events.push_back(Event {
                id,
                seq,
                kind,
                ts_ist: ist_rfc3339(Utc::now()),
                coalesce_key,
                payload,
            });

            while ring.events.len() > self.capacity {
                // Evict the oldest droppable event; fulls go only as a last
                // resort.
                let victim = ring
                    .events
                    .iter()
                    .position(|e| e.kind != EventKind::PanelFull)
                    .unwrap_or(0);
                ring.events.remove(victim);
                *ring.dropped.entry("backlog_overflow".to_string()).or_default() += 1;
            }
            id
        };

        // A send error only means no subscriber is listening right now.
        let _ = self.notify.send(id);
        debug!("event {} published: {}", id, kind.as_str());
        id
    }

    /// Events strictly after `after_id`, capped at `limit`.
    pub fn events_after(&self, after_id: u64, limit: usize) -> Vec<Event> {
        let ring = self.ring.lock();
        ring.events
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest_id(&self) -> u64 {
        self.ring.lock().next_id.saturating_sub(1)
    }

    pub fn last_panel_full_id(&self) -> Option<u64> {
        self.ring.lock().last_panel_full_id
    }

    /// Gap between the newest event and the last full baseline; drives the
    /// snapshot guard.
    pub fn snapshot_gap(&self) -> u64 {
        let ring = self.ring.lock();
        let latest = ring.next_id.saturating_sub(1);
        latest.saturating_sub(ring.last_panel_full_id.unwrap_or(0))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.notify.subscribe()
    }

    pub fn dropped_totals(&self) -> BTreeMap<String, u64> {
        self.ring.lock().dropped.clone()
    }

    pub fn backlog_len(&self) -> usize {
        self.ring.lock().events.len()
    }
}
