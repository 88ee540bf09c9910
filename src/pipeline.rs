use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::composite_provider::CompositeProvider;
use crate::config::{AppConfig, ExpiryTag, IndexConfig};
use crate::coverage::{self, ExpiryStatus};
use crate::enrichment::{EnrichedOption, Enricher};
use crate::expiry_resolver::ExpiryResolver;
use crate::market_calendar::ist_now;
use crate::provider::Instrument;
use crate::strike_universe::StrikeUniverseCache;

/// Everything collected for one (index, expiry tag) in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirySnapshot {
    pub index: String,
    pub tag: ExpiryTag,
    pub expiry_date: NaiveDate,
    pub options: Vec<EnrichedOption>,
    pub strike_coverage: f64,
    pub field_coverage: f64,
    pub interpolated_fraction: f64,
    pub quality_score: f64,
    pub status: ExpiryStatus,
    pub partial_reasons: BTreeSet<String>,
    pub requested_strikes: usize,
    pub clamped: bool,
}

impl ExpirySnapshot {
    fn failed(
        index: &str,
        tag: ExpiryTag,
        expiry_date: NaiveDate,
        requested_strikes: usize,
        reason: &str,
    ) -> Self {
        let mut partial_reasons = BTreeSet::new();
        partial_reasons.insert(reason.to_string());
        Self {
            index: index.to_string(),
            tag,
            expiry_date,
            options: Vec::new(),
            strike_coverage: 0.0,
            field_coverage: 0.0,
            interpolated_fraction: 0.0,
            quality_score: 0.0,
            status: ExpiryStatus::Empty,
            partial_reasons,
            requested_strikes,
            clamped: false,
        }
    }

    /// Rows carrying positive delta-notional exposure, used for drift alerts.
    pub fn delta_notional(&self) -> f64 {
        self.options
            .iter()
            .filter_map(|o| o.delta.map(|d| d * o.oi as f64 * o.strike))
            .sum()
    }
}

/// Per-index result of one cycle's pipeline run.
#[derive(Debug, Clone)]
pub struct IndexCycleOutcome {
    pub index: String,
    pub spot: Option<f64>,
    pub snapshots: Vec<ExpirySnapshot>,
    pub unresolved_tags: Vec<ExpiryTag>,
    /// Index-level failure (no spot, nothing resolved); expiry-level issues
    /// live in each snapshot's partial_reasons.
    pub failure: Option<String>,
    pub partial_reason_totals: BTreeMap<String, u64>,
    pub options_total: usize,
    pub elapsed_ms: u64,
}

impl IndexCycleOutcome {
    pub fn failed(index: &str, reason: &str) -> Self {
        Self {
            index: index.to_string(),
            spot: None,
            snapshots: Vec::new(),
            unresolved_tags: Vec::new(),
            failure: Some(reason.to_string()),
            partial_reason_totals: BTreeMap::new(),
            options_total: 0,
            elapsed_ms: 0,
        }
    }

    pub fn had_errors(&self) -> bool {
        self.failure.is_some()
            || !self.unresolved_tags.is_empty()
            || self.snapshots.iter().any(|s| s.status != ExpiryStatus::Ok)
    }
}

/// Process-wide collaborators every index pipeline shares.
pub struct PipelineShared {
    pub cfg: AppConfig,
    pub provider: Arc<CompositeProvider>,
    pub enricher: Enricher,
    pub strikes: StrikeUniverseCache,
    pub resolver: ExpiryResolver,
}

/// Run the staged pipeline for one index. Stage failures downgrade the
/// affected expiry with a `partial_reason`; only a missing spot price fails
/// the index as a whole. The cycle is always finalized by the caller.
pub async fn run_index(
    shared: Arc<PipelineShared>,
    index: IndexConfig,
    depth_scale: f64,
    deadline: Instant,
) -> IndexCycleOutcome {
    let started = Instant::now();
    let symbol = index.symbol.clone();

    // Spot LTP once per index per cycle; everything hangs off it.
    let spot = match shared.provider.get_spot(&symbol, deadline).await {
        Ok(s) => s.price,
        Err(err) => {
            warn!("index {} failed to fetch spot: {}", symbol, err);
            let mut outcome = IndexCycleOutcome::failed(&symbol, err.partial_reason());
            outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            return outcome;
        }
    };

    let today = ist_now().date_naive();
    let resolution = shared.resolver.resolve_all(&index, today);

    // Instrument universe once per index; each expiry prefilters its slice.
    let instruments = match shared.provider.get_instruments(&symbol, deadline).await {
        Ok(list) => list,
        Err(err) => {
            let mut outcome = IndexCycleOutcome::failed(&symbol, err.partial_reason());
            outcome.spot = Some(spot);
            outcome.unresolved_tags = resolution.unresolved;
            outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            return outcome;
        }
    };

    let mut snapshots = Vec::new();
    let mut partial_reason_totals: BTreeMap<String, u64> = BTreeMap::new();

    for (tag, expiry_date) in &resolution.resolved {
        let snapshot = collect_expiry(
            &shared,
            &index,
            *tag,
            *expiry_date,
            spot,
            depth_scale,
            &instruments,
            deadline,
        )
        .await;
        for reason in &snapshot.partial_reasons {
            *partial_reason_totals.entry(reason.clone()).or_default() += 1;
        }
        snapshots.push(snapshot);
    }

    let options_total = snapshots.iter().map(|s| s.options.len()).sum();
    IndexCycleOutcome {
        index: symbol,
        spot: Some(spot),
        snapshots,
        unresolved_tags: resolution.unresolved,
        failure: None,
        partial_reason_totals,
        options_total,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

#[allow(clippy::too_many_arguments)]
async fn collect_expiry(
    shared: &PipelineShared,
    index: &IndexConfig,
    tag: ExpiryTag,
    expiry_date: NaiveDate,
    spot: f64,
    depth_scale: f64,
    instruments: &[Instrument],
    deadline: Instant,
) -> ExpirySnapshot {
    let universe = shared.strikes.build(
        index,
        spot,
        depth_scale,
        shared.cfg.adaptive.strike_min,
    );

    // Prefilter: canonical expiry, in-universe strikes, both option types.
    let mut selected: Vec<Instrument> = instruments
        .iter()
        .filter(|i| i.expiry_date == expiry_date && universe.contains(i.strike))
        .cloned()
        .collect();

    let mut clamped = false;
    let mut forced_partial = false;
    let max = shared.cfg.collection.prefilter_max_instruments;
    if selected.len() > max {
        // Keep the contracts nearest ATM.
        selected.sort_by(|a, b| {
            (a.strike - universe.atm)
                .abs()
                .total_cmp(&(b.strike - universe.atm).abs())
        });
        selected.truncate(max);
        clamped = true;
        debug!(
            "prefilter clamped {} {} to {} instruments",
            index.symbol,
            tag.as_str(),
            max
        );
        if shared.cfg.collection.prefilter_strict {
            forced_partial = true;
        }
    }

    let (rows, stats) = match shared.enricher.enrich(&selected, spot, deadline).await {
        Ok(res) => res,
        Err(err) => {
            return ExpirySnapshot::failed(
                &index.symbol,
                tag,
                expiry_date,
                universe.strikes.len(),
                err.partial_reason(),
            );
        }
    };
    let _ = stats;

    let mut outcome = crate::validation::validate_rows(rows, expiry_date, &shared.cfg.collection);
    let canonical_date = outcome.salvaged_expiry.unwrap_or(expiry_date);
    if clamped && shared.cfg.collection.prefilter_strict {
        outcome.partial_reasons.insert("prefilter_clamp".to_string());
    }

    let report = coverage::classify(
        &universe.strikes,
        &outcome.rows,
        &shared.cfg.coverage,
        forced_partial || !outcome.partial_reasons.is_empty(),
    );

    ExpirySnapshot {
        index: index.symbol.clone(),
        tag,
        expiry_date: canonical_date,
        options: outcome.rows,
        strike_coverage: report.strike_coverage,
        field_coverage: report.field_coverage,
        interpolated_fraction: report.interpolated_fraction,
        quality_score: report.quality_score,
        status: report.status,
        partial_reasons: outcome.partial_reasons,
        requested_strikes: universe.strikes.len(),
        clamped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::enrichment::Enricher;
    use crate::market_calendar::MarketCalendar;
    use crate::provider::{MarketProvider, MockProvider, ProviderError};
    use crate::quote_cache::QuoteCache;
    use std::time::Duration;

    fn upcoming_thursday() -> NaiveDate {
        let mut d = ist_now().date_naive();
        while d.weekday() != chrono::Weekday::Thu {
            d = d.succ_opt().unwrap();
        }
        d
    }

    fn shared_with(mock: Arc<MockProvider>) -> Arc<PipelineShared> {
        let mut cfg = AppConfig::default();
        cfg.indices = vec![IndexConfig::new("NIFTY", 50.0, 2, 2)];
        let provider = Arc::new(CompositeProvider::new(
            ProviderConfig::default(),
            vec![("primary".to_string(), mock as Arc<dyn MarketProvider>)],
            None,
        ));
        let cache = Arc::new(QuoteCache::new(Duration::from_secs(1)));
        let calendar = Arc::new(MarketCalendar::new(&cfg.market));
        Arc::new(PipelineShared {
            enricher: Enricher::new(cache, provider.clone(), None),
            strikes: StrikeUniverseCache::new(64),
            resolver: ExpiryResolver::new(calendar),
            provider,
            cfg,
        })
    }

    use chrono::Datelike;

    #[tokio::test]
    async fn healthy_index_collects_ok_snapshots() {
        let expiry = upcoming_thursday();
        let mock = Arc::new(MockProvider::new("primary", vec![expiry]));
        let shared = shared_with(mock);
        let index = shared.cfg.indices[0].clone();

        let deadline = Instant::now() + Duration::from_secs(10);
        let outcome = run_index(shared, index, 1.0, deadline).await;

        assert!(outcome.failure.is_none());
        assert_eq!(outcome.snapshots.len(), 1);
        let snap = &outcome.snapshots[0];
        assert_eq!(snap.status, ExpiryStatus::Ok);
        // 2 ITM + ATM + 2 OTM, both CE and PE.
        assert_eq!(snap.options.len(), 10);
        assert_eq!(snap.requested_strikes, 5);
        assert!(outcome.options_total == 10);
    }

    #[tokio::test]
    async fn spot_failure_fails_the_index() {
        let expiry = upcoming_thursday();
        let mock = Arc::new(MockProvider::new("primary", vec![expiry]));
        mock.fail_spot_with(ProviderError::Auth("expired".into()));
        let shared = shared_with(mock);
        let index = shared.cfg.indices[0].clone();

        let deadline = Instant::now() + Duration::from_secs(10);
        let outcome = run_index(shared, index, 1.0, deadline).await;
        assert_eq!(outcome.failure.as_deref(), Some("auth_failed"));
        assert!(outcome.snapshots.is_empty());
        assert!(outcome.had_errors());
    }

    #[tokio::test]
    async fn quote_failure_downgrades_expiry_not_index() {
        let expiry = upcoming_thursday();
        let mock = Arc::new(MockProvider::new("primary", vec![expiry]));
        // Enough errors to exhaust the retry loop within the expiry.
        mock.queue_quote_errors(vec![
            ProviderError::Fatal("bad request".into()),
        ]);
        let shared = shared_with(mock);
        let index = shared.cfg.indices[0].clone();

        let deadline = Instant::now() + Duration::from_secs(10);
        let outcome = run_index(shared, index, 1.0, deadline).await;
        assert!(outcome.failure.is_none());
        let snap = &outcome.snapshots[0];
        assert_eq!(snap.status, ExpiryStatus::Empty);
        assert!(snap.partial_reasons.contains("provider_fatal"));
        assert_eq!(
            outcome.partial_reason_totals.get("provider_fatal"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn depth_scale_shrinks_universe() {
        let expiry = upcoming_thursday();
        let mock = Arc::new(MockProvider::new("primary", vec![expiry]));
        let shared = shared_with(mock);
        let mut index = shared.cfg.indices[0].clone();
        index.strikes_itm = 8;
        index.strikes_otm = 8;

        let deadline = Instant::now() + Duration::from_secs(10);
        let outcome = run_index(shared, index, 0.5, deadline).await;
        let snap = &outcome.snapshots[0];
        assert_eq!(snap.requested_strikes, 9); // 4 + 1 + 4
    }
}
