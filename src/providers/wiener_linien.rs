//! Municipal realtime provider (Wiener Linien)
//!
//! Polls the public realtime endpoint for disturbance and news lists.
//! Records are kept when their status is active and they are not pure
//! facility-maintenance notes; there is no regional filter because the
//! source is in-region by definition. Related records are bundled by
//! (category, topic, line set) so one incident affecting several lines
//! becomes a single event with a `U1/U2:` style title prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::WlConfig;
use crate::error::Result;
use crate::fetch::{header_map, SecureClient};
use crate::models::{make_guid, Event, SOURCE_WIENER_LINIEN};
use crate::text::{collapse_ws, html_to_text};

/// Grace window before an ended record is dropped.
const ACTIVE_GRACE_MINUTES: i64 = 10;

/// Status markers that mean a record is no longer active.
const INACTIVE_MARKERS: &[&str] = &[
    "finished",
    "inactive",
    "inaktiv",
    "done",
    "closed",
    "nicht aktiv",
    "ended",
    "ende",
    "abgeschlossen",
    "beendet",
    "geschlossen",
];

/// Restriction vocabulary: a news item must match to count as a disruption.
static KW_RESTRICTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(umleitung|ersatzverkehr|unterbrech|sperr|gesperrt|störung|stoerung|arbeiten|baustell|einschränk|verspät|ausfall|verkehr|kurzführung|kurzfuehrung|teilbetrieb|pendelverkehr|kurzstrecke)",
    )
    .unwrap()
});

/// Marketing and service chatter that is not a disruption.
static KW_EXCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(willkommen|gewinnspiel|anzeiger|eröffnung|eroeffnung|service(?:-info)?|info(?:rmation)?|fest|keine\s+echtzeitinfo)\b",
    )
    .unwrap()
});

/// Pure facility notes (lifts, escalators).
static FACILITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(aufzug|aufzüge|aufzuege|lift|fahrstuhl|fahrtreppe|fahrtreppen|rolltreppe|rolltreppen|aufzugsinfo|fahrtreppeninfo)\b",
    )
    .unwrap()
});

/// Generic labels stripped from title heads when informative text follows.
static LABEL_HEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:bauarbeiten|straßenbauarbeiten|strassenbauarbeiten|gleisbauarbeiten|verkehrsinfo|verkehrsinformation|verkehrsmeldung|störung|stoerung|hinweis|serviceinfo|service-info|information)\s*(?:[-:–—/]\s*|\s+))+",
    )
    .unwrap()
});

static ANGLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[<>«»‹›]+").unwrap());
static NON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\wäöüÄÖÜß]+").unwrap());
static INFORMATIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-zÄÖÜäöüß0-9]{3,}").unwrap());

/// Generic filler removed before topic extraction.
static GENERIC_FILLER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(fahrtbehinderung|verkehrsbehinderung|behinderung|störung|stoerung|hinweis|meldung|serviceinfo|service-info|betrieb\s+ab.*|betrieb\s+nur.*)\b",
    )
    .unwrap()
});

/// Topic tokens that identify an incident independent of phrasing.
const TOPIC_TOKENS: &[&str] = &[
    "falschparker",
    "polizeieinsatz",
    "rettungseinsatz",
    "unfall",
    "signalstörung",
    "signalstoerung",
    "umleitung",
    "ersatzverkehr",
    "kurzführung",
    "kurzfuehrung",
    "sperre",
    "gesperrt",
];

// Line detection from titles, with dates/times/addresses masked first
static LINE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:U\d{1,2}|S\d{1,2}|N\d{1,3}|\d{1,3}[A-Z]?|[A-Z])\b").unwrap());
static RUF_BUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Rufbus\s+([A-Za-z0-9]+)").unwrap());
static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}\.\d{1,2}\.?(?:\d{2}|\d{4})?\b").unwrap());
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}\b").unwrap());
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b([A-Za-zÄÖÜäöüß-]+(?:gasse|straße|strasse|platz|allee|weg|steig|ufer|brücke|kai|ring))\s+\d+\b",
    )
    .unwrap()
});
static LINE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[A-Za-z0-9]+(?:/[A-Za-z0-9]+){0,20}\s*:\s*").unwrap()
});

// ============================================================================
// Record-level helpers
// ============================================================================

fn status_blob(obj: &Value) -> String {
    let attrs = &obj["attributes"];
    [
        obj["status"].as_str().unwrap_or(""),
        attrs["status"].as_str().unwrap_or(""),
        attrs["state"].as_str().unwrap_or(""),
    ]
    .join(" ")
    .to_lowercase()
}

fn is_inactive(obj: &Value) -> bool {
    let blob = status_blob(obj);
    INACTIVE_MARKERS.iter().any(|m| blob.contains(m))
}

fn is_facility_only(texts: &[&str]) -> bool {
    FACILITY_RE.is_match(&texts.join(" "))
}

fn parse_iso(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| crate::models::parse_instant(s).ok())
}

/// Most plausible timestamp of a record when `time.start` is absent.
fn best_ts(obj: &Value) -> Option<DateTime<Utc>> {
    [
        &obj["time"]["start"],
        &obj["time"]["end"],
        &obj["updated"],
        &obj["timestamp"],
        &obj["attributes"]["lastUpdate"],
        &obj["attributes"]["created"],
    ]
    .into_iter()
    .find_map(parse_iso)
}

fn is_active(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if let Some(start) = start {
        if start > now {
            return false;
        }
    }
    if let Some(end) = end {
        if end < now - Duration::minutes(ACTIVE_GRACE_MINUTES) {
            return false;
        }
    }
    true
}

/// Remove generic labels from a title head when informative text remains.
pub fn tidy_title(title: &str) -> String {
    let t = title.trim();
    if t.is_empty() {
        return String::new();
    }
    let stripped = LABEL_HEAD_RE.replace(t, "");
    let kept = if !stripped.is_empty() && INFORMATIVE_RE.is_match(&stripped) {
        stripped.into_owned()
    } else {
        t.to_string()
    };
    collapse_ws(&ANGLE_RE.replace_all(&kept, ""))
        .trim_matches([' ', '-', '–', '—', ':', '/', '\t'])
        .to_string()
}

fn title_core(title: &str) -> String {
    let tidy = tidy_title(title);
    collapse_ws(&NON_WORD_RE.replace_all(&tidy, " ")).to_lowercase()
}

/// Topic key: known incident tokens when present, else the tidied core.
pub fn topic_key(raw_title: &str) -> String {
    let defillered = GENERIC_FILLER_RE.replace_all(raw_title, " ");
    let normalised = NON_WORD_RE.replace_all(&defillered, " ").to_lowercase();
    let mut topics: Vec<&str> = normalised
        .split_whitespace()
        .filter(|w| TOPIC_TOKENS.contains(w))
        .collect();
    topics.sort_unstable();
    topics.dedup();
    if topics.is_empty() {
        title_core(raw_title)
    } else {
        topics.join(" ")
    }
}

fn clean_line_token(raw: &str) -> String {
    let stripped = RUF_BUS_RE.replace(raw, "$1");
    stripped
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Line pairs (token, display) from the `relatedLines` payload.
fn lines_from_related(value: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut seen = BTreeSet::new();
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::String(_) => vec![value],
        _ => Vec::new(),
    };
    for item in items {
        let raw = match item {
            Value::String(s) => s.clone(),
            Value::Object(o) => o
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => continue,
        };
        let token = clean_line_token(&raw);
        if !token.is_empty() && seen.insert(token.clone()) {
            pairs.push((token, clean_line_token(&raw)));
        }
    }
    pairs
}

/// Fallback detection of line codes in the title, after masking dates,
/// times and house numbers that would look like line numbers.
pub fn lines_from_text(text: &str) -> Vec<(String, String)> {
    let mut masked = DATE_RE.replace_all(text, " ").into_owned();
    masked = TIME_RE.replace_all(&masked, " ").into_owned();
    masked = ADDRESS_RE.replace_all(&masked, "$1").into_owned();

    let mut pairs = Vec::new();
    let mut seen = BTreeSet::new();
    for cap in RUF_BUS_RE.captures_iter(&masked) {
        let token = clean_line_token(&cap[1]);
        if !token.is_empty() && seen.insert(token.clone()) {
            pairs.push((token.clone(), token));
        }
    }
    for m in LINE_CODE_RE.find_iter(&masked) {
        let token = clean_line_token(m.as_str());
        if !token.is_empty() && seen.insert(token.clone()) {
            pairs.push((token.clone(), token));
        }
    }
    pairs
}

fn stop_names(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if let Value::Array(items) = value {
        for item in items {
            let raw = match item {
                Value::String(s) => s.as_str(),
                Value::Object(o) => o
                    .get("name")
                    .or_else(|| o.get("stopName"))
                    .or_else(|| o.get("title"))
                    .and_then(Value::as_str)
                    .unwrap_or(""),
                _ => "",
            };
            let clean = collapse_ws(raw);
            if clean.chars().any(char::is_alphabetic) {
                names.insert(clean);
            }
        }
    }
    names
}

// ============================================================================
// Raw records and bundling
// ============================================================================

#[derive(Debug)]
struct RawRecord {
    category: &'static str,
    title: String,
    title_core: String,
    topic: String,
    desc: String,
    extras: Vec<String>,
    lines: Vec<(String, String)>,
    stops: BTreeSet<String>,
    pub_date: Option<DateTime<Utc>>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    identity: String,
}

fn build_identity(category: &str, lines: &[(String, String)], start: Option<DateTime<Utc>>) -> String {
    let mut tokens: Vec<&str> = lines.iter().map(|(t, _)| t.as_str()).collect();
    tokens.sort_unstable();
    // Keyed by the local service day so the identity survives re-publishes
    // within the same day
    let day = start
        .map(|dt| {
            dt.with_timezone(&chrono_tz::Europe::Vienna)
                .date_naive()
                .to_string()
        })
        .unwrap_or_else(|| "None".to_string());
    format!(
        "wl|{}|L={}|D={day}",
        category.to_lowercase(),
        tokens.join(",")
    )
}

fn collect_record(obj: &Value, category: &'static str, now: DateTime<Utc>) -> Option<RawRecord> {
    if is_inactive(obj) {
        return None;
    }
    let attrs = &obj["attributes"];
    let title_raw = obj["title"]
        .as_str()
        .or_else(|| obj["name"].as_str())
        .unwrap_or("Meldung")
        .trim()
        .to_string();
    let desc_raw = obj["description"].as_str().unwrap_or("").trim().to_string();
    let subtitle = obj["subtitle"].as_str().unwrap_or("");

    if is_facility_only(&[title_raw.as_str(), desc_raw.as_str(), subtitle]) {
        return None;
    }

    let start = parse_iso(&obj["time"]["start"]).or_else(|| best_ts(obj));
    let end = parse_iso(&obj["time"]["end"]);
    if !is_active(start, end, now) {
        return None;
    }

    // Disturbances drop marketing chatter, news items must positively look
    // like a restriction
    let relevance_blob = format!(
        "{title_raw} {subtitle} {desc_raw} {} {}",
        attrs["status"].as_str().unwrap_or(""),
        attrs["state"].as_str().unwrap_or(""),
    );
    if category == "Störung" {
        if KW_EXCLUDE.is_match(&relevance_blob) && !KW_RESTRICTION.is_match(&relevance_blob) {
            return None;
        }
    } else if !KW_RESTRICTION.is_match(&relevance_blob) {
        return None;
    }

    let mut lines = lines_from_related(
        obj.get("relatedLines")
            .filter(|v| !v.is_null())
            .unwrap_or(&attrs["relatedLines"]),
    );
    if lines.is_empty() {
        lines = lines_from_text(&title_raw);
    }
    let stops = stop_names(
        obj.get("relatedStops")
            .filter(|v| !v.is_null())
            .unwrap_or(&attrs["relatedStops"]),
    );

    let mut extras = Vec::new();
    if !subtitle.is_empty() {
        extras.push(collapse_ws(subtitle));
    }
    for key in ["status", "state", "station", "location", "reason", "towards"] {
        if let Some(value) = attrs[key].as_str() {
            let clean = collapse_ws(value);
            if !clean.is_empty() {
                let label = {
                    let mut chars = key.chars();
                    let first = chars.next().unwrap_or_default().to_uppercase();
                    format!("{first}{}", chars.as_str())
                };
                extras.push(format!("{label}: {clean}"));
            }
        }
    }

    Some(RawRecord {
        category,
        title: tidy_title(&title_raw),
        title_core: title_core(&title_raw),
        topic: topic_key(&title_raw),
        desc: html_to_text(&desc_raw),
        extras,
        identity: build_identity(category, &lines, start),
        lines,
        stops,
        pub_date: start,
        starts_at: start,
        ends_at: end,
    })
}

/// Title quality: more informative tokens win, then longer cores, then the
/// shorter rendered title.
fn title_quality(title: &str, core: &str) -> (usize, usize, isize) {
    let informative = core.split_whitespace().filter(|t| t.len() >= 4).count();
    (informative, core.len(), -(collapse_ws(title).len() as isize))
}

/// Description quality: anything beating a bare title repeat wins, then
/// mentions of concrete stops, then plain length.
fn desc_quality(desc: &str, title: &str, stops: &BTreeSet<String>) -> (u8, usize, usize) {
    let normalized = collapse_ws(desc);
    if normalized.is_empty() {
        return (0, 0, 0);
    }
    let non_title = u8::from(normalized.to_lowercase() != collapse_ws(title).to_lowercase());
    let lower = normalized.to_lowercase();
    let hits = stops
        .iter()
        .filter(|s| s.len() >= 3 && lower.contains(&s.to_lowercase()))
        .count();
    (non_title, hits, normalized.len())
}

fn apply_bus_filter(record: &mut RawRecord, config: &WlConfig) -> bool {
    let Some(exclude) = &config.bus_exclude else {
        return true;
    };
    let had_lines = !record.lines.is_empty();
    record.lines.retain(|(token, _)| {
        if let Some(include) = &config.bus_include {
            if include.is_match(token) {
                return true;
            }
        }
        !exclude.is_match(token)
    });
    // All lines excluded: the event is about nothing we report
    !(had_lines && record.lines.is_empty())
}

/// Bundle raw records into final events.
fn assemble(records: Vec<RawRecord>, config: &WlConfig, now: DateTime<Utc>) -> Vec<Event> {
    let mut buckets: BTreeMap<String, RawRecord> = BTreeMap::new();
    for mut record in records {
        if !apply_bus_filter(&mut record, config) {
            continue;
        }
        let mut tokens: Vec<&str> = record.lines.iter().map(|(t, _)| t.as_str()).collect();
        tokens.sort_unstable();
        let key = make_guid(&["wl", record.category, &record.topic, &tokens.join(",")]);

        match buckets.get_mut(&key) {
            None => {
                buckets.insert(key, record);
            }
            Some(bucket) => {
                if title_quality(&record.title, &record.title_core)
                    > title_quality(&bucket.title, &bucket.title_core)
                {
                    bucket.title = record.title.clone();
                    bucket.title_core = record.title_core.clone();
                }
                if desc_quality(&record.desc, &record.title, &record.stops)
                    > desc_quality(&bucket.desc, &bucket.title, &bucket.stops)
                {
                    bucket.desc = record.desc.clone();
                }
                for pair in record.lines {
                    if !bucket.lines.iter().any(|(t, _)| t == &pair.0) {
                        bucket.lines.push(pair);
                    }
                }
                bucket.stops.extend(record.stops);
                for extra in record.extras {
                    if !bucket.extras.contains(&extra) {
                        bucket.extras.push(extra);
                    }
                }
                bucket.pub_date = match (bucket.pub_date, record.pub_date) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                bucket.ends_at = match (bucket.ends_at, record.ends_at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
        }
    }

    // Drop multi-line aggregates whose lines are all covered by
    // single-line events
    let mut single_coverage: BTreeMap<String, usize> = BTreeMap::new();
    for bucket in buckets.values() {
        if bucket.lines.len() == 1 {
            *single_coverage
                .entry(bucket.lines[0].0.clone())
                .or_default() += 1;
        }
    }

    let mut events = Vec::new();
    for bucket in buckets.into_values() {
        if bucket.lines.len() >= 2
            && bucket
                .lines
                .iter()
                .all(|(t, _)| single_coverage.get(t).copied().unwrap_or(0) > 0)
        {
            continue;
        }

        let line_display: Vec<&str> = bucket.lines.iter().map(|(_, d)| d.as_str()).collect();
        let mut title = if line_display.is_empty() {
            // Without lines, a stop name gives the title its anchor
            match bucket.stops.iter().next() {
                Some(stop) if !bucket.title.to_lowercase().contains(&stop.to_lowercase()) => {
                    format!("{} – {}", bucket.title, stop)
                }
                _ => bucket.title.clone(),
            }
        } else {
            let prefix = line_display.join("/");
            let stripped = LINE_PREFIX_RE.replace(&bucket.title, "").into_owned();
            let rest = collapse_ws(&stripped);
            if rest.is_empty() {
                prefix
            } else {
                format!("{prefix}: {rest}")
            }
        };
        let halt_count = bucket.stops.len();
        if halt_count > 0 {
            let plural = if halt_count == 1 { "Halt" } else { "Halte" };
            title.push_str(&format!(" ({halt_count} {plural})"));
        }
        let title = collapse_ws(&ANGLE_RE.replace_all(&title, ""));

        let mut desc = bucket.desc.clone();
        for extra in bucket
            .extras
            .iter()
            .filter(|e| !e.to_lowercase().starts_with("linien:"))
        {
            if desc.is_empty() {
                desc = extra.clone();
            } else {
                desc = format!("{desc} • {extra}");
            }
        }
        if !bucket.stops.is_empty() {
            let names: Vec<&str> = bucket.stops.iter().map(String::as_str).collect();
            let suffix = format!("Betroffene Haltestellen: {}", names.join(", "));
            desc = if desc.is_empty() {
                suffix
            } else {
                format!("{desc} • {suffix}")
            };
        }
        let desc = collapse_ws(&desc.replace(['<', '>'], ""));

        let mut tokens: Vec<&str> = bucket.lines.iter().map(|(t, _)| t.as_str()).collect();
        tokens.sort_unstable();
        let guid = make_guid(&["wl", bucket.category, &bucket.topic, &tokens.join(",")]);

        events.push(Event {
            source: SOURCE_WIENER_LINIEN.into(),
            category: bucket.category.into(),
            title,
            description: desc,
            link: "https://www.wienerlinien.at".into(),
            guid,
            pub_date: bucket.pub_date.unwrap_or(now),
            starts_at: bucket.starts_at,
            ends_at: bucket.ends_at,
            identity: Some(bucket.identity),
        });
    }

    events.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(a.guid.cmp(&b.guid)));
    events
}

/// Decode the two endpoint payloads into final events.
pub fn parse_payloads(
    traffic: &Value,
    news: &Value,
    config: &WlConfig,
    now: DateTime<Utc>,
) -> Vec<Event> {
    let mut records = Vec::new();
    if let Some(infos) = traffic["data"]["trafficInfos"].as_array() {
        for obj in infos {
            if let Some(record) = collect_record(obj, "Störung", now) {
                records.push(record);
            }
        }
    }
    if let Some(pois) = news["data"]["pois"].as_array() {
        for obj in pois {
            if let Some(record) = collect_record(obj, "Hinweis", now) {
                records.push(record);
            }
        }
    }
    assemble(records, config, now)
}

/// Poll both endpoints and build the provider's events.
pub async fn fetch_events(config: &WlConfig, client: &SecureClient) -> Result<Vec<Event>> {
    let headers = header_map(&[("Accept", "application/json")]);
    let base = config.base_url.trim_end_matches('/');
    let now = Utc::now();

    // Explicitly no facility feeds in the selection
    let traffic_url = format!("{base}/trafficInfoList?name=stoerunglang&name=stoerungkurz");
    let traffic = match client.get(&traffic_url, headers.clone()).await {
        Ok(response) => serde_json::from_slice(&response.body).unwrap_or_else(|e| {
            warn!(error = %e, "trafficInfoList returned invalid JSON");
            Value::Null
        }),
        Err(e) => {
            warn!(error = %e, "trafficInfoList fetch failed");
            Value::Null
        }
    };

    let news_url = format!("{base}/newsList");
    let news = match client.get(&news_url, headers).await {
        Ok(response) => serde_json::from_slice(&response.body).unwrap_or_else(|e| {
            warn!(error = %e, "newsList returned invalid JSON");
            Value::Null
        }),
        Err(e) => {
            warn!(error = %e, "newsList fetch failed");
            Value::Null
        }
    };

    let events = parse_payloads(&traffic, &news, config, now);
    info!(items = events.len(), "Wiener Linien refresh complete");
    Ok(events)
}
