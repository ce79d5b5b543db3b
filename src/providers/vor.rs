//! Regional-authority REST provider (VOR/VAO DepartureBoard)
//!
//! The upstream allows roughly 100 requests per day, so this adapter is
//! built around three defences:
//!
//! 1. Pre-flight: refuse the whole refresh if the configured work
//!    (rotations per day × stations per run) would exceed the daily budget.
//! 2. Per-run circuit breaker: abort once the run has issued more than a
//!    small ceiling of requests.
//! 3. Persistent counter: every attempt is recorded in the shared daily
//!    counter file *before* the request leaves the process.
//!
//! Stations are visited in a deterministic round-robin keyed by the clock,
//! so repeated runs cycle through the configured list without shared state.
//! Station ids are opaque strings throughout.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Europe::Vienna;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::VorConfig;
use crate::error::{Error, Result};
use crate::fetch::{header_map, SecureClient};
use crate::models::{make_guid, Event};
use crate::stations::StationCatalogue;
use crate::storage::DailyQuota;
use crate::text::{collapse_ws, html_to_text};

pub const SOURCE: &str = "VOR/VAO";

/// HIM categories that are real impairments.
const ALLOWED_CATEGORIES: &[(u8, &str)] = &[
    (0, "Ersatzverkehr"),
    (1, "Baustelle"),
    (2, "Ausfall"),
    (5, "Notfall"),
    (9, "Vorankündigung"),
];

/// At most this many line/stop names are listed in a description.
const LIST_CAP: usize = 15;

static INACTIVE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^(false|0|no)$").unwrap());

// ============================================================================
// Budget checks
// ============================================================================

/// Projected requests per day for the configured rotation.
pub fn projected_daily_requests(config: &VorConfig) -> u64 {
    let rotation_secs = config.rotation.as_secs().max(60);
    let rotations_per_day = 86_400 / rotation_secs;
    let station_count = if config.station_ids.is_empty() {
        config.station_names.len()
    } else {
        config.station_ids.len()
    };
    rotations_per_day * config.max_stations_per_run.min(station_count.max(1)) as u64
}

/// Pre-flight: refuse to start when the schedule cannot fit the budget.
pub fn preflight(config: &VorConfig) -> Result<()> {
    let projected = projected_daily_requests(config);
    if projected > config.daily_budget as u64 {
        return Err(Error::RateLimitExceeded {
            provider: "vor".into(),
            detail: format!(
                "configured rotation needs {projected} requests/day, budget is {}",
                config.daily_budget
            ),
        });
    }
    Ok(())
}

/// Deterministic round-robin selection over the station list.
///
/// The window start is `floor(now / rotation) mod N`, so consecutive runs
/// walk the list without any state file.
pub fn select_stations(ids: &[String], config: &VorConfig, now: DateTime<Utc>) -> Vec<String> {
    if ids.is_empty() {
        return Vec::new();
    }
    let slot = (now.timestamp().max(0) as u64) / config.rotation.as_secs().max(1);
    let offset = (slot % ids.len() as u64) as usize;
    let take = config.max_stations_per_run.min(ids.len());
    (0..take)
        .map(|i| ids[(offset + i) % ids.len()].clone())
        .collect()
}

// ============================================================================
// XML decoding
// ============================================================================

#[derive(Debug, Deserialize)]
struct DepartureBoard {
    #[serde(rename = "Messages")]
    messages: Option<Messages>,
}

#[derive(Debug, Deserialize)]
struct Messages {
    #[serde(rename = "Message", default)]
    message: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@act")]
    act: Option<String>,
    #[serde(rename = "@category")]
    category: Option<String>,
    #[serde(rename = "@head")]
    head: Option<String>,
    #[serde(rename = "@text")]
    text: Option<String>,
    #[serde(rename = "@sDate")]
    s_date: Option<String>,
    #[serde(rename = "@sTime")]
    s_time: Option<String>,
    #[serde(rename = "@eDate")]
    e_date: Option<String>,
    #[serde(rename = "@eTime")]
    e_time: Option<String>,
    #[serde(rename = "affectedStops")]
    affected_stops: Option<AffectedStops>,
    #[serde(rename = "products")]
    products: Option<Products>,
}

#[derive(Debug, Deserialize)]
struct AffectedStops {
    #[serde(rename = "Stop", default)]
    stop: Vec<Stop>,
}

#[derive(Debug, Deserialize)]
struct Stop {
    #[serde(rename = "@name")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Products {
    #[serde(rename = "Product", default)]
    product: Vec<Product>,
}

#[derive(Debug, Deserialize)]
struct Product {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@line")]
    line: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocationList {
    #[serde(rename = "StopLocation", default)]
    stop_location: Vec<StopLocation>,
}

#[derive(Debug, Deserialize)]
struct StopLocation {
    #[serde(rename = "@id")]
    id: Option<String>,
}

/// Board timestamps are Vienna local time without offset.
fn parse_local_dt(date: Option<&str>, time: Option<&str>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date?.trim(), "%Y-%m-%d").ok()?;
    let raw_time = time.unwrap_or("00:00:00").trim();
    let time = NaiveTime::parse_from_str(raw_time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw_time, "%H:%M"))
        .unwrap_or(NaiveTime::MIN);
    let local = date.and_time(time);
    local
        .and_local_timezone(Vienna)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_name_list(names: &[String]) -> String {
    let mut sorted: Vec<String> = names
        .iter()
        .map(|n| collapse_ws(n))
        .filter(|n| !n.is_empty())
        .collect();
    sorted.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()));
    sorted.dedup();
    let truncated = sorted.len() > LIST_CAP;
    let mut text = sorted
        .into_iter()
        .take(LIST_CAP)
        .collect::<Vec<_>>()
        .join(", ");
    if truncated {
        text.push_str(" …");
    }
    text
}

/// Decode one board response into events.
pub fn parse_board(xml: &str, now: DateTime<Utc>) -> Vec<Event> {
    let board: DepartureBoard = match quick_xml::de::from_str(xml) {
        Ok(board) => board,
        Err(e) => {
            warn!(error = %e, "DepartureBoard response is not parseable XML");
            return Vec::new();
        }
    };
    let messages = match board.messages {
        Some(m) => m.message,
        None => return Vec::new(),
    };

    let mut events = Vec::new();
    for msg in messages {
        let Some(msg_id) = msg.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        if msg
            .act
            .as_deref()
            .map(|a| INACTIVE_RE.is_match(a.trim()))
            .unwrap_or(false)
        {
            continue;
        }
        let Some(cat_code) = msg
            .category
            .as_deref()
            .and_then(|c| c.trim().parse::<u8>().ok())
        else {
            // Textual categories are not impairments we track
            continue;
        };
        let Some(&(_, category)) = ALLOWED_CATEGORIES.iter().find(|(c, _)| *c == cat_code) else {
            continue;
        };

        let head = collapse_ws(&html_to_text(msg.head.as_deref().unwrap_or("")));
        let text = html_to_text(msg.text.as_deref().unwrap_or(""));

        let starts_at = parse_local_dt(msg.s_date.as_deref(), msg.s_time.as_deref());
        let ends_at = parse_local_dt(msg.e_date.as_deref(), msg.e_time.as_deref());

        let stops: Vec<String> = msg
            .affected_stops
            .iter()
            .flat_map(|a| &a.stop)
            .filter_map(|s| s.name.clone())
            .collect();
        let lines: Vec<String> = msg
            .products
            .iter()
            .flat_map(|p| &p.product)
            .filter_map(|p| p.name.clone().or_else(|| p.line.clone()))
            .collect();

        let mut desc_parts: Vec<String> = Vec::new();
        if !text.is_empty() {
            desc_parts.push(text);
        }
        let line_list = format_name_list(&lines);
        if !line_list.is_empty() {
            desc_parts.push(format!("Linien: {line_list}"));
        }
        let stop_list = format_name_list(&stops);
        if !stop_list.is_empty() {
            desc_parts.push(format!("Betroffene Haltestellen: {stop_list}"));
        }
        let description = if desc_parts.is_empty() {
            head.clone()
        } else {
            desc_parts.join(" • ")
        };

        let guid = make_guid(&["vao", &cat_code.to_string(), msg_id]);
        events.push(Event {
            source: SOURCE.into(),
            category: category.into(),
            title: if head.is_empty() {
                category.into()
            } else {
                head
            },
            description,
            link: "https://www.vor.at/".into(),
            guid,
            pub_date: starts_at.unwrap_or(now),
            starts_at,
            ends_at,
            identity: None,
        });
    }
    events
}

/// Merge events with the same guid across boards: earliest publication
/// wins, an open end wins over any fixed end, descriptions are unioned.
pub fn merge_boards(batches: Vec<Vec<Event>>) -> Vec<Event> {
    let mut by_guid: HashMap<String, Event> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for ev in batches.into_iter().flatten() {
        match by_guid.get_mut(&ev.guid) {
            None => {
                order.push(ev.guid.clone());
                by_guid.insert(ev.guid.clone(), ev);
            }
            Some(existing) => {
                if ev.pub_date < existing.pub_date {
                    existing.pub_date = ev.pub_date;
                }
                existing.ends_at = match (existing.ends_at, ev.ends_at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
                if !ev.description.is_empty()
                    && !existing.description.contains(&ev.description)
                {
                    existing.description =
                        format!("{} • {}", existing.description, ev.description);
                }
            }
        }
    }
    let mut out: Vec<Event> = order.into_iter().filter_map(|g| by_guid.remove(&g)).collect();
    out.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(a.guid.cmp(&b.guid)));
    out
}

// ============================================================================
// Fetching
// ============================================================================

fn auth_query(config: &VorConfig) -> Option<String> {
    if config.auth_in_header {
        None
    } else {
        config.access_id.clone()
    }
}

fn auth_headers(config: &VorConfig) -> reqwest::header::HeaderMap {
    let mut pairs: Vec<(&str, &str)> = vec![("Accept", "application/xml")];
    let id;
    if config.auth_in_header {
        if let Some(access_id) = &config.access_id {
            id = access_id.clone();
            pairs.push(("accessId", id.as_str()));
        }
    }
    header_map(&pairs)
}

fn board_url(config: &VorConfig, station_id: &str, now: DateTime<Utc>) -> String {
    let local = now.with_timezone(&Vienna);
    let mut url = format!(
        "{}/DepartureBoard?format=xml&id={}&date={}&time={}&duration=60&rtMode=SERVER_DEFAULT",
        config.base_url.trim_end_matches('/'),
        station_id,
        local.format("%Y-%m-%d"),
        local.format("%H:%M"),
    );
    // The credential travels either in the query or as a header, never both
    if let Some(access_id) = auth_query(config) {
        url.push_str("&accessId=");
        url.push_str(&access_id);
    }
    url
}

fn location_url(config: &VorConfig, name: &str) -> String {
    let mut url = format!(
        "{}/location.name?format=xml&input={}",
        config.base_url.trim_end_matches('/'),
        urlencode(name),
    );
    if let Some(access_id) = auth_query(config) {
        url.push_str("&accessId=");
        url.push_str(&access_id);
    }
    url
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

struct RunBudget<'a> {
    quota: &'a DailyQuota,
    config: &'a VorConfig,
    run_count: u32,
}

impl<'a> RunBudget<'a> {
    /// Record one attempt against both the per-run ceiling and the
    /// persistent daily counter, before the request is made.
    fn register_attempt(&mut self) -> Result<()> {
        self.run_count += 1;
        if self.run_count > self.config.max_requests_per_run {
            return Err(Error::RateLimitExceeded {
                provider: "vor".into(),
                detail: format!(
                    "per-run ceiling of {} requests reached",
                    self.config.max_requests_per_run
                ),
            });
        }
        let daily = self.quota.increment()?;
        if daily > self.config.daily_budget {
            return Err(Error::RateLimitExceeded {
                provider: "vor".into(),
                detail: format!("daily budget of {} requests used up", self.config.daily_budget),
            });
        }
        Ok(())
    }
}

/// Resolve configured station names to ids, preferring the catalogue and
/// falling back to the `location.name` endpoint (which costs budget).
async fn resolve_station_ids(
    config: &VorConfig,
    client: &SecureClient,
    catalogue: &StationCatalogue,
    budget: &mut RunBudget<'_>,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for name in &config.station_names {
        let from_catalogue = catalogue.vor_ids(name);
        if !from_catalogue.is_empty() {
            ids.extend(from_catalogue);
            continue;
        }
        budget.register_attempt()?;
        let url = location_url(config, name);
        match client.get(&url, auth_headers(config)).await {
            Ok(response) => {
                let list: LocationList = match quick_xml::de::from_str(&response.text()) {
                    Ok(list) => list,
                    Err(e) => {
                        warn!(error = %e, "location.name response unparseable");
                        continue;
                    }
                };
                if let Some(id) = list.stop_location.first().and_then(|s| s.id.clone()) {
                    debug!(station = %name, "resolved station id via location.name");
                    ids.push(id);
                }
            }
            Err(e) => warn!(station = %name, error = %e, "location.name lookup failed"),
        }
    }
    Ok(ids)
}

/// Run one refresh: select the rotation window, fetch each board and merge.
pub async fn fetch_events(
    config: &VorConfig,
    client: &SecureClient,
    catalogue: &StationCatalogue,
    quota: &DailyQuota,
) -> Result<Vec<Event>> {
    if config.access_id.is_none() {
        return Err(Error::config(
            "VOR provider enabled but VOR_ACCESS_ID is not set",
        ));
    }
    preflight(config)?;

    let mut budget = RunBudget {
        quota,
        config,
        run_count: 0,
    };
    let now = Utc::now();

    let ids = if config.station_ids.is_empty() {
        resolve_station_ids(config, client, catalogue, &mut budget).await?
    } else {
        config.station_ids.clone()
    };
    if ids.is_empty() {
        info!("no VOR stations configured, provider inactive");
        return Ok(Vec::new());
    }

    let selected = select_stations(&ids, config, now);
    let mut batches = Vec::with_capacity(selected.len());
    for station_id in &selected {
        budget.register_attempt()?;
        let url = board_url(config, station_id, now);
        match client.get(&url, auth_headers(config)).await {
            Ok(response) => batches.push(parse_board(&response.text(), now)),
            Err(e) => warn!(station = %station_id, error = %e, "DepartureBoard fetch failed"),
        }
    }

    let events = merge_boards(batches);
    info!(
        stations = selected.len(),
        items = events.len(),
        "VOR refresh complete"
    );
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn config() -> VorConfig {
        VorConfig {
            enabled: true,
            access_id: Some("test-access".into()),
            auth_in_header: false,
            base_url: "https://routenplaner.verkehrsauskunft.at/vao/restproxy/v1.3".into(),
            station_ids: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            station_names: Vec::new(),
            rotation: Duration::from_secs(30 * 60),
            max_stations_per_run: 2,
            daily_budget: 100,
            max_requests_per_run: 10,
            http_timeout: Duration::from_secs(15),
        }
    }

    #[test]
    fn test_preflight_accepts_fitting_schedule() {
        // 48 rotations × 2 stations = 96 <= 100
        assert!(preflight(&config()).is_ok());
    }

    #[test]
    fn test_preflight_refuses_oversized_schedule() {
        // 48 rotations × 5 stations = 240 > 120
        let mut cfg = config();
        cfg.daily_budget = 120;
        cfg.max_stations_per_run = 5;
        let err = preflight(&cfg).unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));
    }

    #[test]
    fn test_rotation_is_deterministic_and_walks_the_list() {
        let cfg = config();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 7, 10, 0).unwrap();
        let first = select_stations(&cfg.station_ids, &cfg, now);
        let again = select_stations(&cfg.station_ids, &cfg, now);
        assert_eq!(first, again);
        assert_eq!(first.len(), 2);

        // The next rotation slot starts one station later
        let later = now + chrono::Duration::minutes(30);
        let next = select_stations(&cfg.station_ids, &cfg, later);
        assert_ne!(first, next);
        let idx_first = cfg.station_ids.iter().position(|s| s == &first[0]).unwrap();
        let idx_next = cfg.station_ids.iter().position(|s| s == &next[0]).unwrap();
        assert_eq!((idx_first + 1) % cfg.station_ids.len(), idx_next);
    }

    const BOARD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DepartureBoard>
  <Messages>
    <Message id="him_42" act="true" category="1" head="S7: Bauarbeiten"
             text="Schienenersatzverkehr"
             sDate="2025-06-01" sTime="09:00:00" eDate="2025-06-03" eTime="21:00:00">
      <affectedStops><Stop name="Wien Mitte"/><Stop name="Flughafen Wien"/></affectedStops>
      <products><Product name="S7"/></products>
    </Message>
    <Message id="him_43" act="false" category="2" head="Ausfall" text="ignoriert"/>
    <Message id="him_44" act="true" category="7" head="Hinweis" text="falsche Kategorie"/>
    <Message act="true" category="1" head="ohne id" text="ignoriert"/>
  </Messages>
</DepartureBoard>"#;

    #[test]
    fn test_parse_board_filters_and_converts_local_time() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap();
        let events = parse_board(BOARD, now);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.category, "Baustelle");
        assert_eq!(ev.title, "S7: Bauarbeiten");
        assert!(ev.description.starts_with("Schienenersatzverkehr"));
        assert!(ev.description.contains("Linien: S7"));
        assert!(ev.description.contains("Betroffene Haltestellen: Flughafen Wien, Wien Mitte"));
        // 09:00 Vienna summer time is 07:00 UTC
        assert_eq!(
            ev.starts_at.unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap()
        );
        assert_eq!(
            ev.ends_at.unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 3, 19, 0, 0).unwrap()
        );
        assert_eq!(ev.guid, make_guid(&["vao", "1", "him_42"]));
    }

    #[test]
    fn test_merge_boards_unifies_duplicate_messages() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap();
        let a = parse_board(BOARD, now);
        let mut b = parse_board(BOARD, now);
        b[0].pub_date = now - chrono::Duration::hours(2);
        b[0].ends_at = None;
        b[0].description = "Zusatzinfo vom zweiten Board".into();

        let merged = merge_boards(vec![a, b]);
        assert_eq!(merged.len(), 1);
        let ev = &merged[0];
        assert_eq!(ev.pub_date, now - chrono::Duration::hours(2));
        // Open end wins over the fixed end
        assert!(ev.ends_at.is_none());
        assert!(ev.description.contains("Zusatzinfo vom zweiten Board"));
    }

    #[test]
    fn test_credential_location_is_exclusive() {
        let mut cfg = config();
        let url = board_url(&cfg, "490101200", Utc::now());
        assert!(url.contains("accessId=test-access"));
        assert!(!auth_headers(&cfg).contains_key("accessId"));

        cfg.auth_in_header = true;
        let url = board_url(&cfg, "490101200", Utc::now());
        assert!(!url.contains("accessId"));
        assert!(auth_headers(&cfg).contains_key("accessId"));
    }

    #[test]
    fn test_run_budget_circuit_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let quota = DailyQuota::new(dir.path().join("requests.json"));
        let mut cfg = config();
        cfg.max_requests_per_run = 3;
        let mut budget = RunBudget {
            quota: &quota,
            config: &cfg,
            run_count: 0,
        };
        for _ in 0..3 {
            budget.register_attempt().unwrap();
        }
        let err = budget.register_attempt().unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));
        // The breaker fired before the counter was touched a fourth time
        assert_eq!(quota.current(), 3);
    }

    #[test]
    fn test_run_budget_daily_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let quota = DailyQuota::new(dir.path().join("requests.json"));
        let mut cfg = config();
        cfg.daily_budget = 2;
        cfg.max_requests_per_run = 10;
        let mut budget = RunBudget {
            quota: &quota,
            config: &cfg,
            run_count: 0,
        };
        budget.register_attempt().unwrap();
        budget.register_attempt().unwrap();
        let err = budget.register_attempt().unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));
        // The denied attempt still counts against the budget
        assert_eq!(quota.current(), 3);
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("Wien Mitte"), "Wien%20Mitte");
        assert_eq!(urlencode("Mödling"), "M%C3%B6dling");
        assert_eq!(urlencode("a-b_c.d~e"), "a-b_c.d~e");
    }
}
