//! Feed-build pipeline: Collect → Normalise → Prune → Dedupe → Order →
//! Clip → Emit
//!
//! The build reads only the local provider caches written by earlier
//! refresh runs; there is no network activity here. Cache reads run in a
//! bounded worker pool with a per-provider deadline, a provider failure
//! becomes an empty contribution, and the rest of the pipeline is
//! deterministic and single-threaded.

pub mod dedupe;
pub mod rss;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::models::Event;
use crate::providers::ProviderKind;
use crate::storage::{atomic_write, CacheStore, FirstSeenMap, FirstSeenStore};

/// Outcome summary of one feed build.
#[derive(Debug)]
pub struct BuildOutcome {
    pub raw_items: usize,
    pub emitted_items: usize,
    pub enabled_providers: usize,
    pub providers_with_data: usize,
}

/// Per-provider result line for the run report.
#[derive(Debug)]
enum ProviderStatus {
    Ok(usize),
    Empty,
    Failed(String),
    TimedOut,
}

// ============================================================================
// Collect
// ============================================================================

fn worker_limit(enabled: usize, configured: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let cap = if configured > 0 { configured } else { available };
    enabled.min(cap).max(1)
}

/// Read all enabled provider caches concurrently.
///
/// Each read gets its own deadline; on timeout or error the provider's
/// contribution becomes empty and the run report records why.
async fn collect(
    config: &Config,
    store: Arc<CacheStore>,
) -> (Vec<Event>, HashMap<ProviderKind, ProviderStatus>) {
    let enabled: Vec<ProviderKind> = ProviderKind::all()
        .into_iter()
        .filter(|p| p.is_enabled(config))
        .collect();
    let semaphore = Arc::new(Semaphore::new(worker_limit(
        enabled.len(),
        config.runtime.provider_max_workers,
    )));

    let mut handles = Vec::with_capacity(enabled.len());
    for provider in enabled {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        let timeout = config.runtime.provider_timeout;
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let read = tokio::task::spawn_blocking(move || store.read(provider.cache_name()));
            let result = match tokio::time::timeout(timeout, read).await {
                Err(_) => Err(ProviderStatus::TimedOut),
                Ok(Err(join_err)) => Err(ProviderStatus::Failed(join_err.to_string())),
                Ok(Ok(Err(read_err))) => Err(ProviderStatus::Failed(read_err.to_string())),
                Ok(Ok(Ok(events))) => Ok(events),
            };
            (provider, result)
        }));
    }

    let mut events = Vec::new();
    let mut statuses = HashMap::new();
    for handle in handles {
        let Ok((provider, result)) = handle.await else {
            continue;
        };
        match result {
            Ok(batch) => {
                let status = if batch.is_empty() {
                    warn!(provider = %provider, "cache empty, building feed without current data");
                    ProviderStatus::Empty
                } else {
                    ProviderStatus::Ok(batch.len())
                };
                statuses.insert(provider, status);
                events.extend(batch);
            }
            Err(status) => {
                match &status {
                    ProviderStatus::TimedOut => {
                        warn!(provider = %provider, "cache read hit the provider deadline")
                    }
                    ProviderStatus::Failed(reason) => {
                        warn!(provider = %provider, reason = %reason, "cache read failed")
                    }
                    _ => {}
                }
                statuses.insert(provider, status);
            }
        }
    }
    (events, statuses)
}

// ============================================================================
// Normalise
// ============================================================================

/// Enforce interval sanity on collected events: an end before the start is
/// upstream noise and becomes an open end.
pub fn normalise(events: &mut [Event]) {
    for event in events.iter_mut() {
        if let (Some(starts_at), Some(ends_at)) = (event.starts_at, event.ends_at) {
            if ends_at < starts_at {
                event.ends_at = None;
            }
        }
    }
}

// ============================================================================
// Prune
// ============================================================================

/// Drop events that ended, aged out, or have lingered since their first
/// sighting beyond the age limit.
pub fn prune(
    events: Vec<Event>,
    now: DateTime<Utc>,
    state: &FirstSeenMap,
    max_item_age_days: i64,
    absolute_max_age_days: i64,
    ends_at_grace_minutes: i64,
) -> Vec<Event> {
    let grace = Duration::minutes(ends_at_grace_minutes);
    let max_age = Duration::days(max_item_age_days);
    let absolute_max = Duration::days(absolute_max_age_days);

    events
        .into_iter()
        .filter(|event| {
            if let Some(ends_at) = event.ends_at {
                if ends_at < now - grace {
                    return false;
                }
            }

            let age = now - event.pub_date;
            if age > absolute_max {
                return false;
            }
            if age > max_age {
                let has_future_end = event.ends_at.map(|e| e > now).unwrap_or(false);
                if !has_future_end {
                    return false;
                }
            }

            // Events already known from earlier builds age by their first
            // sighting as well, so undated re-publishes cannot linger
            if let Some(first_seen) = state.get(&event.identity()) {
                if now - first_seen > max_age {
                    let has_future_end = event.ends_at.map(|e| e > now).unwrap_or(false);
                    if !has_future_end {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

// ============================================================================
// Order
// ============================================================================

/// Sort for emission and apply the fresh-window publication bump.
///
/// Newly seen events whose publication lies within the window around `now`
/// get `now` as publication so aggregators surface them; afterwards no
/// publication may lie in the future.
pub fn order(
    events: &mut [Event],
    now: DateTime<Utc>,
    state: &FirstSeenMap,
    fresh_window_min: i64,
) {
    let window = Duration::minutes(fresh_window_min.max(0));
    for event in events.iter_mut() {
        if fresh_window_min > 0
            && !state.contains(&event.identity())
            && (now - event.pub_date).abs() <= window
        {
            event.pub_date = now;
        }
        if event.pub_date > now {
            event.pub_date = now;
        }
    }
    events.sort_by(|a, b| {
        b.pub_date
            .cmp(&a.pub_date)
            .then(b.starts_at.cmp(&a.starts_at))
            .then(a.title.cmp(&b.title))
    });
}

// ============================================================================
// Build
// ============================================================================

/// Run a complete feed build: read caches, run the pipeline, write the RSS
/// file and persist the reduced first-seen state.
pub async fn build(config: &Config) -> Result<BuildOutcome> {
    let started = Instant::now();
    let now = Utc::now();
    config.log_sanity_warnings();

    let enabled_providers = ProviderKind::all()
        .iter()
        .filter(|p| p.is_enabled(config))
        .count();

    let state_store = FirstSeenStore::new(config.state_path.clone(), config.state_retention_days);
    let mut state = state_store.load(now);

    // One top-level deadline over the whole collection phase; on expiry
    // the build aborts and the previous feed file stays untouched
    let overall_deadline = config
        .runtime
        .provider_timeout
        .saturating_mul(enabled_providers.max(1) as u32)
        + std::time::Duration::from_secs(5);
    let store = Arc::new(CacheStore::new(config.base_dir.clone(), config.cache_pretty));
    let (mut events, statuses) = tokio::time::timeout(overall_deadline, collect(config, store))
        .await
        .map_err(|_| {
            crate::error::Error::other("provider collection exceeded the overall deadline")
        })?;
    normalise(&mut events);
    let raw_items = events.len();
    let providers_with_data = statuses
        .values()
        .filter(|s| matches!(s, ProviderStatus::Ok(_)))
        .count();

    let pruned = prune(
        events,
        now,
        &state,
        config.feed.max_item_age_days,
        config.feed.absolute_max_age_days,
        config.feed.ends_at_grace_minutes,
    );
    let mut deduped = dedupe::dedupe(pruned);
    order(
        &mut deduped,
        now,
        &state,
        config.feed.fresh_pubdate_window_min,
    );

    // A failed write surfaces as a storage error; the previous feed file
    // stays intact thanks to the atomic rename
    let (xml, identities) = rss::render(&deduped, now, &mut state, &config.feed);
    atomic_write(&config.out_path, xml.as_bytes())?;

    // The state only tracks what the feed currently shows
    state.retain_emitted(&identities.iter().cloned().collect());
    if let Err(e) = state_store.save(&state) {
        warn!(error = %e, "first-seen state persist failed, feed was still written");
    }

    let provider_summary: Vec<String> = statuses
        .iter()
        .map(|(p, s)| match s {
            ProviderStatus::Ok(n) => format!("{p}:ok({n})"),
            ProviderStatus::Empty => format!("{p}:empty"),
            ProviderStatus::Failed(_) => format!("{p}:error"),
            ProviderStatus::TimedOut => format!("{p}:timeout"),
        })
        .collect();
    info!(
        raw = raw_items,
        emitted = identities.len(),
        providers = %provider_summary.join(", "),
        duration_ms = started.elapsed().as_millis() as u64,
        out = %config.out_path.display(),
        "feed build finished"
    );

    Ok(BuildOutcome {
        raw_items,
        emitted_items: identities.len(),
        enabled_providers,
        providers_with_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(guid: &str, pub_date: DateTime<Utc>) -> Event {
        Event {
            source: "Wiener Linien".into(),
            category: "Störung".into(),
            title: format!("Titel {guid}"),
            description: "Text".into(),
            link: String::new(),
            guid: guid.into(),
            pub_date,
            starts_at: None,
            ends_at: None,
            identity: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_normalise_drops_inverted_intervals() {
        let mut ev = event("WL-1", now());
        ev.starts_at = Some(now());
        ev.ends_at = Some(now() - Duration::hours(1));
        let mut events = vec![ev];
        normalise(&mut events);
        assert!(events[0].ends_at.is_none());
        assert!(events[0].starts_at.is_some());
    }

    #[test]
    fn test_prune_age_limits() {
        let state = FirstSeenMap::default();
        // Scenario: an event from 2020 without end is far over every limit
        let ancient = event("WL-2", Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let recent = event("WL-3", now() - Duration::days(3));
        let out = prune(vec![ancient, recent], now(), &state, 365, 540, 10);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].guid, "WL-3");
    }

    #[test]
    fn test_prune_keeps_old_event_with_future_end() {
        let state = FirstSeenMap::default();
        let mut long_running = event("WL-4", now() - Duration::days(400));
        long_running.ends_at = Some(now() + Duration::days(30));
        let out = prune(vec![long_running], now(), &state, 365, 540, 10);
        assert_eq!(out.len(), 1);

        // But the absolute cutoff wins even with a future end
        let mut fossil = event("WL-5", now() - Duration::days(600));
        fossil.ends_at = Some(now() + Duration::days(30));
        assert!(prune(vec![fossil], now(), &state, 365, 540, 10).is_empty());
    }

    #[test]
    fn test_prune_ended_event_grace() {
        let state = FirstSeenMap::default();
        // Ended exactly now: kept with the default grace
        let mut ending = event("WL-6", now() - Duration::hours(5));
        ending.ends_at = Some(now());
        assert_eq!(
            prune(vec![ending.clone()], now(), &state, 365, 540, 10).len(),
            1
        );
        // Zero grace drops it
        assert!(prune(vec![ending.clone()], now(), &state, 365, 540, 0).is_empty());
        // Ended beyond the grace window: dropped
        ending.ends_at = Some(now() - Duration::minutes(11));
        assert!(prune(vec![ending], now(), &state, 365, 540, 10).is_empty());
    }

    #[test]
    fn test_prune_by_first_seen_age() {
        let mut state = FirstSeenMap::default();
        state.record("WL-7", now() - Duration::days(400));
        // Upstream keeps re-publishing with a fresh date, but the feed has
        // shown it for over a year
        let lingering = event("WL-7", now() - Duration::days(1));
        assert!(prune(vec![lingering], now(), &state, 365, 540, 10).is_empty());
    }

    #[test]
    fn test_order_sorts_and_breaks_ties_by_title() {
        let state = FirstSeenMap::default();
        let shared = now() - Duration::hours(2);
        let mut events = vec![
            event("b", shared),
            event("a", shared),
            event("c", now() - Duration::hours(1)),
        ];
        order(&mut events, now(), &state, 0);
        assert_eq!(events[0].guid, "c");
        assert_eq!(events[1].guid, "a");
        assert_eq!(events[2].guid, "b");
    }

    #[test]
    fn test_order_fresh_window_bump() {
        let state = FirstSeenMap::default();
        let mut events = vec![event("fresh", now() - Duration::minutes(3))];
        order(&mut events, now(), &state, 5);
        assert_eq!(events[0].pub_date, now());

        // Already-seen events keep their original publication
        let mut state_seen = FirstSeenMap::default();
        state_seen.record("seen", now() - Duration::days(1));
        let mut events = vec![event("seen", now() - Duration::minutes(3))];
        order(&mut events, now(), &state_seen, 5);
        assert_eq!(events[0].pub_date, now() - Duration::minutes(3));
    }

    #[test]
    fn test_order_clamps_future_pubdates() {
        let mut state = FirstSeenMap::default();
        state.record("future", now() - Duration::days(1));
        let mut events = vec![event("future", now() + Duration::hours(3))];
        order(&mut events, now(), &state, 5);
        assert!(events[0].pub_date <= now());
    }

    #[test]
    fn test_worker_limit() {
        assert_eq!(worker_limit(3, 1), 1);
        assert_eq!(worker_limit(3, 8), 3);
        assert!(worker_limit(3, 0) >= 1);
        assert_eq!(worker_limit(0, 0), 1);
    }
}
