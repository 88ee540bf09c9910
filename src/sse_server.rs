use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::event_bus::{Event, EventKind};

/// Per-IP connect budget over a sliding window ("N/seconds").
pub struct ConnectRateLimiter {
    limit: u32,
    window: Duration,
    per_ip: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl ConnectRateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(window_secs),
            per_ip: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut per_ip = self.per_ip.lock();
        let log = per_ip.entry(ip).or_default();
        while log
            .front()
            .map(|t| now.duration_since(*t) > self.window)
            .unwrap_or(false)
        {
            log.pop_front();
        }
        if log.len() >= self.limit as usize {
            return false;
        }
        log.push_back(now);
        true
    }
}

/// Per-connection token bucket over non-heartbeat events: sustained
/// `events_per_sec` with a 2x burst; exhausted buckets delay, not drop.
pub struct EventThrottle {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl EventThrottle {
    pub fn new(events_per_sec: u32) -> Self {
        let rate = events_per_sec.max(1) as f64;
        Self {
            rate,
            burst: rate * 2.0,
            tokens: rate * 2.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        self.tokens = (self.tokens + self.rate * now.duration_since(self.last_refill).as_secs_f64())
            .min(self.burst);
        self.last_refill = now;
    }

    /// Duration to wait before the next token is available (zero if one is
    /// ready, in which case it is consumed).
    pub fn take(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

struct ConnGuard {
    ctx: Arc<AppContext>,
    id: Uuid,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.ctx.status.sse_clients.fetch_sub(1, Ordering::Relaxed);
        self.ctx.metrics.sse_clients.dec();
        debug!("sse connection {} closed", self.id);
    }
}

struct SseShared {
    ctx: Arc<AppContext>,
    connect_rate: ConnectRateLimiter,
    shutdown: watch::Receiver<bool>,
}

pub fn router(ctx: Arc<AppContext>, shutdown: watch::Receiver<bool>) -> Router {
    let (limit, window) = ctx.cfg.sse.connect_rate_parts();
    let shared = Arc::new(SseShared {
        ctx,
        connect_rate: ConnectRateLimiter::new(limit, window),
        shutdown,
    });
    Router::new()
        .route("/summary/events", get(events_handler))
        .route("/summary/resync", get(resync_handler))
        .route("/summary/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve the SSE/resync/health/metrics surface until shutdown flips.
pub async fn serve(ctx: Arc<AppContext>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", ctx.cfg.sse.host, ctx.cfg.sse.port);
    let app = router(ctx, shutdown.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🌐 SSE/metrics endpoint listening on {}", addr);
    let mut shutdown = shutdown;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await?;
    Ok(())
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn too_many() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "5")],
        "connection limit reached",
    )
        .into_response()
}

async fn events_handler(
    State(shared): State<Arc<SseShared>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ctx = &shared.ctx;
    let sse_cfg = &ctx.cfg.sse;

    if let Some(expected) = &sse_cfg.api_token {
        let provided = headers
            .get("x-api-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != expected {
            return reject(StatusCode::UNAUTHORIZED, "missing or invalid API token");
        }
    }
    if !sse_cfg.ip_allow.is_empty() && !sse_cfg.ip_allow.iter().any(|a| a == &addr.ip().to_string())
    {
        return reject(StatusCode::FORBIDDEN, "ip not allowed");
    }
    if !sse_cfg.ua_allow_prefixes.is_empty() {
        let ua = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !sse_cfg.ua_allow_prefixes.iter().any(|p| ua.starts_with(p)) {
            return reject(StatusCode::FORBIDDEN, "user agent not allowed");
        }
    }
    if !shared.connect_rate.admit(addr.ip()) {
        return too_many();
    }
    if ctx.status.sse_clients.load(Ordering::Relaxed) >= sse_cfg.max_connections {
        return too_many();
    }

    let conn_id = Uuid::new_v4();
    ctx.status.sse_clients.fetch_add(1, Ordering::Relaxed);
    ctx.metrics.sse_clients.inc();
    let guard = Arc::new(ConnGuard {
        ctx: ctx.clone(),
        id: conn_id,
    });

    let force_full = params.get("force_full").map(|v| v == "1").unwrap_or(false);
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if force_full {
        ctx.metrics
            .events_forced_full_total
            .with_label_values(&["client_request"])
            .inc();
    }
    info!(
        "sse connect {} from {} (last_event_id={:?}, force_full={})",
        conn_id,
        addr.ip(),
        last_event_id,
        force_full
    );

    // Connect preamble: hello (hash directory), then the baseline full
    // snapshot, then the live stream after the client's cursor.
    let mut intro = VecDeque::new();
    intro.push_back(
        SseEvent::default()
            .event("hello")
            .retry(Duration::from_millis(sse_cfg.retry_ms))
            .data(
                json!({
                    "conn": conn_id.to_string(),
                    "cycle": ctx.status.cycle.load(Ordering::Relaxed),
                    "latest_event_id": ctx.bus.latest_id(),
                    "panel_hashes": ctx.panels.hashes(),
                })
                .to_string(),
            ),
    );
    intro.push_back(
        SseEvent::default()
            .event("full_snapshot")
            .data(
                json!({
                    "cycle": ctx.status.cycle.load(Ordering::Relaxed),
                    "panels": ctx.panels.envelopes(),
                })
                .to_string(),
            ),
    );

    let heartbeat = Duration::from_secs(
        (sse_cfg.heartbeat_cycles.max(1) as u64) * ctx.cfg.schedule.interval_secs.max(1),
    );
    let state = ConnState {
        ctx: ctx.clone(),
        rx: ctx.bus.subscribe(),
        shutdown: shared.shutdown.clone(),
        cursor: last_event_id.unwrap_or_else(|| ctx.bus.latest_id()),
        pending: VecDeque::new(),
        intro,
        throttle: EventThrottle::new(sse_cfg.events_per_sec),
        heartbeat,
        max_event_bytes: sse_cfg.max_event_bytes,
        said_bye: false,
        _guard: guard,
    };

    Sse::new(event_stream(state))
        .keep_alive(KeepAlive::new().interval(heartbeat).text("hb"))
        .into_response()
}

struct ConnState {
    ctx: Arc<AppContext>,
    rx: tokio::sync::broadcast::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
    cursor: u64,
    pending: VecDeque<Event>,
    intro: VecDeque<SseEvent>,
    throttle: EventThrottle,
    heartbeat: Duration,
    max_event_bytes: usize,
    said_bye: bool,
    _guard: Arc<ConnGuard>,
}

fn event_stream(state: ConnState) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(ev) = st.intro.pop_front() {
                st.ctx.metrics.sse_events_sent_total.inc();
                st.ctx.status.sse_events_sent.fetch_add(1, Ordering::Relaxed);
                return Some((Ok(ev), st));
            }
            if st.said_bye {
                return None;
            }

            if let Some(event) = st.pending.pop_front() {
                let wait = st.throttle.take();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                    let _ = st.throttle.take();
                }
                let sse = render_event(&event, st.max_event_bytes);
                st.ctx.metrics.sse_events_sent_total.inc();
                st.ctx.status.sse_events_sent.fetch_add(1, Ordering::Relaxed);
                return Some((Ok(sse), st));
            }

            let batch = st.ctx.bus.events_after(st.cursor, 64);
            if let Some(last) = batch.last() {
                st.cursor = last.id;
                st.pending.extend(batch);
                continue;
            }

            tokio::select! {
                _ = st.rx.recv() => {}
                _ = tokio::time::sleep(st.heartbeat) => {
                    // Idle heartbeat rides outside the throttle budget.
                    return Some((Ok(SseEvent::default().comment("hb")), st));
                }
                changed = st.shutdown.changed() => {
                    let stopping = changed.is_ok() && *st.shutdown.borrow();
                    if stopping {
                        st.said_bye = true;
                        let bye = SseEvent::default()
                            .event("bye")
                            .data(json!({"reason": "shutdown"}).to_string());
                        return Some((Ok(bye), st));
                    }
                }
            }
        }
    })
}

fn render_event(event: &Event, max_bytes: usize) -> SseEvent {
    let mut payload = serde_json::to_string(&event.payload).unwrap_or_else(|_| "{}".to_string());
    if payload.len() > max_bytes {
        warn!(
            "event {} payload {}B exceeds cap {}B, truncating",
            event.id,
            payload.len(),
            max_bytes
        );
        payload = json!({
            "truncated": true,
            "original_bytes": payload.len(),
            "kind": event.kind.as_str(),
        })
        .to_string();
    }
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.kind.as_str())
        .data(payload)
}

async fn resync_handler(State(shared): State<Arc<SseShared>>) -> Response {
    let ctx = &shared.ctx;
    Json(json!({
        "schema_version": "v1",
        "cycle": ctx.status.cycle.load(Ordering::Relaxed),
        "panels": ctx.panels.envelopes(),
    }))
    .into_response()
}

async fn health_handler(State(shared): State<Arc<SseShared>>) -> Response {
    let ctx = &shared.ctx;
    let status = &ctx.status;
    Json(json!({
        "ok": true,
        "cycle": status.cycle.load(Ordering::Relaxed),
        "schema_version": "v1",
        "market_open": status.market_open.load(Ordering::Relaxed),
        "diff": { "hit_ratio": status.diff_hit_ratio() },
        "panel_updates_last": status.panel_updates_last.load(Ordering::Relaxed),
        "timing": {
            "last_cycle_ms": status.last_cycle_ms.load(Ordering::Relaxed),
            "uptime_seconds": status.uptime_seconds(),
        },
        "sse": {
            "clients": status.sse_clients.load(Ordering::Relaxed),
            "events_sent": status.sse_events_sent.load(Ordering::Relaxed),
        },
    }))
    .into_response()
}

async fn metrics_handler(State(shared): State<Arc<SseShared>>) -> Response {
    match shared.ctx.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => reject(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Publisher-side snapshot guard: when the diff stream has drifted more
/// than `snapshot_gap_max` events past the last full baseline, force a
/// fresh `panel_full`, rate-limited per reason.
pub struct SnapshotGuard {
    gap_max: u64,
    retry: Duration,
    last_forced: Mutex<HashMap<String, Instant>>,
}

impl SnapshotGuard {
    pub fn new(gap_max: u64, retry_seconds: u64) -> Self {
        Self {
            gap_max,
            retry: Duration::from_secs(retry_seconds),
            last_forced: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the reason when a forced full should be emitted now.
    pub fn should_force_full(&self, snapshot_gap: u64) -> Option<&'static str> {
        if snapshot_gap <= self.gap_max {
            return None;
        }
        let mut last = self.last_forced.lock();
        let now = Instant::now();
        match last.get("gap_exceeded") {
            Some(t) if now.duration_since(*t) < self.retry => None,
            _ => {
                last.insert("gap_exceeded".to_string(), now);
                Some("gap_exceeded")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rate_enforces_window() {
        let rl = ConnectRateLimiter::new(2, 60);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(rl.admit(ip));
        assert!(rl.admit(ip));
        assert!(!rl.admit(ip));
        // Distinct IP has its own budget.
        assert!(rl.admit("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn throttle_allows_burst_then_delays() {
        let mut t = EventThrottle::new(10); // burst 20
        for _ in 0..20 {
            assert!(t.take().is_zero());
        }
        let wait = t.take();
        assert!(!wait.is_zero());
        assert!(wait <= Duration::from_millis(150));
    }

    #[test]
    fn snapshot_guard_fires_once_per_retry_window() {
        let guard = SnapshotGuard::new(500, 60);
        assert_eq!(guard.should_force_full(400), None);
        assert_eq!(guard.should_force_full(501), Some("gap_exceeded"));
        // Within the cooldown: suppressed.
        assert_eq!(guard.should_force_full(700), None);
    }

    #[test]
    fn oversized_event_truncates_with_flag() {
        let event = Event {
            id: 7,
            seq: 1,
            kind: EventKind::PanelDiff,
            ts_ist: "t".to_string(),
            coalesce_key: None,
            payload: json!({"blob": "x".repeat(4096)}),
        };
        // Rendering must not panic and must stay under the cap; the flagged
        // replacement payload is tiny.
        let _ = render_event(&event, 256);
    }
}
