//! National-railway RSS provider (ÖBB route information feed)
//!
//! Consumes the HAFAS "Weginformationen" RSS feed, keeps only notices
//! relevant to Vienna and its immediate surroundings, tidies the noisy
//! titles (generic labels, station-type suffixes, dash relations) and
//! emits canonical events. Several candidate feed URLs are tried in order
//! because the upstream occasionally shuffles its query parameters.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::OebbConfig;
use crate::error::Result;
use crate::fetch::{header_map, SecureClient};
use crate::models::{make_guid, Event};
use crate::providers::region;
use crate::stations::StationCatalogue;
use crate::text::{collapse_ws, html_to_text};

pub const SOURCE: &str = "ÖBB (RSS)";

const DEFAULT_RSS_URL: &str =
    "https://fahrplan.oebb.at/bin/help.exe/dnl?protocol=https:&tpl=rss_WI_oebb&";
const FALLBACK_QUERIES: &[&str] = &[
    "?tpl=rss_WI_oebb&protocol=https:",
    "?protocol=https:&tpl=rss_WI_oebb",
    "?tpl=rss_WI_oebb",
    "?L=vs_scotty&tpl=rss_WI_oebb",
    "?L=vs_oebb&tpl=rss_WI_oebb",
];
const FALLBACK_BASE: &str = "https://fahrplan.oebb.at/bin/help.exe/dnl";

// --- Title tidying -----------------------------------------------------------

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:bauarbeiten|zugausfall(?:e)?|geänderte\s*fahrzeiten|fahrplanänderung|einschränkungen?|störung|verkehrsmeldung|baustelle|verkehrsinfo)\s*(?:[-:–—]|/\s*)\s*)+",
    )
    .unwrap()
});
static PAREN_U_S_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\((?:U\d*|S\d*)\)").unwrap());
static BAHNHOF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bBahnhof\b\.?").unwrap());
static BHF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bBhf\.?\b").unwrap());
static DASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s[-–—]\s").unwrap());
static BZW_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\s*bzw\.?\s*").unwrap());

/// Pure facility notices (lifts, escalators) are never disruptions.
static FACILITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(aufzug|aufzüge|lift|fahrstuhl|fahrtreppe|fahrtreppen|rolltreppe|rolltreppen)\b")
        .unwrap()
});

/// Regional anchor: Vienna by name.
static WIEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bWien\b|\bVienna\b").unwrap());

/// Tidy a raw feed title: drop leading labels, station noise and normalise
/// relation separators to `↔`.
pub fn tidy_title(title: &str) -> String {
    let mut t = LABEL_RE.replace(title, "").into_owned();
    t = PAREN_U_S_RE.replace_all(&t, "").into_owned();
    t = BAHNHOF_RE.replace_all(&t, "").into_owned();
    t = BHF_RE.replace_all(&t, "").into_owned();
    t = DASH_RE.replace_all(&t, " ↔ ").into_owned();
    t = BZW_RE.replace_all(&t, "/").into_owned();

    // A bare slash relation gets an arrow before its left-hand side
    if t.contains('/') && !t.contains('↔') {
        if let Some(slash) = t.find('/') {
            let left = &t[..slash];
            if let Some(space) = left.rfind(' ') {
                t = format!("{} ↔ {}{}", &t[..space], &t[space + 1..slash], &t[slash..]);
            }
        }
    }

    let cleaned = collapse_ws(&t)
        .trim_matches([' ', '-', '–', '—', ':', '/', '\t'])
        .to_string();
    if cleaned.is_empty() {
        let fallback = collapse_ws(title);
        if fallback.is_empty() {
            "ÖBB Meldung".to_string()
        } else {
            fallback
        }
    } else {
        cleaned
    }
}

fn is_facility_only(title: &str, desc: &str) -> bool {
    FACILITY_RE.is_match(&format!("{title} {desc}"))
}

/// Strict regional filter: an item must mention Vienna or an in-region
/// catalogue station, and items whose only anchors are out-of-region
/// endpoints are rejected.
fn is_region_relevant(catalogue: &StationCatalogue, title: &str, desc: &str) -> bool {
    let blob = format!("{title} {desc}");
    if WIEN_RE.is_match(&blob) {
        return !region::mentions_far_away(&blob);
    }
    region::keep_by_region(catalogue, title, desc, false)
}

// --- Feed decoding -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/// `<guid>` may carry an `isPermaLink` attribute; only the text matters.
#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text")]
    value: Option<String>,
}

fn parse_rfc2822(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Candidate feed URLs, configured first, deduplicated.
pub fn candidate_urls(config: &OebbConfig) -> Vec<String> {
    let mut urls = Vec::new();
    urls.push(
        config
            .rss_url
            .clone()
            .unwrap_or_else(|| DEFAULT_RSS_URL.to_string()),
    );
    for query in FALLBACK_QUERIES {
        urls.push(format!("{FALLBACK_BASE}{query}"));
    }
    urls.extend(config.alt_urls.iter().cloned());
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        if !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

/// Decode feed XML into events, applying the regional and facility filters.
pub fn parse_feed(xml: &str, catalogue: &StationCatalogue, now: DateTime<Utc>) -> Vec<Event> {
    let rss: Rss = match quick_xml::de::from_str(xml) {
        Ok(rss) => rss,
        Err(e) => {
            warn!(error = %e, "ÖBB feed is not parseable RSS");
            return Vec::new();
        }
    };

    let mut seen_guids = std::collections::HashSet::new();
    let mut events = Vec::new();
    for item in rss.channel.item {
        let raw_title = item.title.unwrap_or_default();
        let title = tidy_title(&html_escape::decode_html_entities(&raw_title));
        let desc_raw = item.description.unwrap_or_default();
        let desc = html_to_text(&desc_raw);
        let link = item
            .link
            .unwrap_or_else(|| "https://www.oebb.at/".to_string());
        let pub_raw = item.pub_date.unwrap_or_default();
        let pub_date = parse_rfc2822(&pub_raw);

        if is_facility_only(&title, &desc) {
            continue;
        }
        if !is_region_relevant(catalogue, &title, &desc) {
            continue;
        }

        let guid = match item
            .guid
            .and_then(|g| g.value)
            .filter(|g| !g.trim().is_empty())
        {
            Some(g) => g.trim().to_string(),
            None => make_guid(&["oebb_rss", &title, &pub_raw, &link]),
        };
        if !seen_guids.insert(guid.clone()) {
            continue;
        }

        events.push(Event {
            source: SOURCE.into(),
            category: "Störung".into(),
            title,
            description: desc,
            link,
            guid,
            pub_date: pub_date.unwrap_or(now),
            starts_at: pub_date,
            ends_at: None,
            identity: None,
        });
    }

    events.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(a.guid.cmp(&b.guid)));
    events
}

/// Fetch and decode the feed, trying candidate URLs until one parses.
pub async fn fetch_events(
    config: &OebbConfig,
    client: &SecureClient,
    catalogue: &StationCatalogue,
) -> Result<Vec<Event>> {
    let headers = header_map(&[(
        "Accept",
        "application/rss+xml, application/xml;q=0.9, */*;q=0.1",
    )]);
    let now = Utc::now();

    for url in candidate_urls(config) {
        match client.get(&url, headers.clone()).await {
            Ok(response) => {
                let body = response.text();
                if body.trim().is_empty() {
                    debug!("ÖBB candidate returned empty body");
                    continue;
                }
                let events = parse_feed(&body, catalogue, now);
                if !events.is_empty() || body.contains("<rss") || body.contains("<channel") {
                    info!(items = events.len(), "ÖBB feed loaded");
                    return Ok(events);
                }
            }
            Err(e) => {
                debug!(error = %e, "ÖBB candidate URL failed");
            }
        }
    }
    warn!("no ÖBB feed candidate produced a parseable response");
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stations::Station;

    fn catalogue() -> StationCatalogue {
        let raw = r#"[
            {"bst_id": "1", "name": "Wien Hbf", "in_vienna": true},
            {"bst_id": "2", "name": "Wien Meidling", "in_vienna": true},
            {"bst_id": "3", "name": "Mödling", "pendler": true}
        ]"#;
        let stations: Vec<Station> = serde_json::from_str(raw).unwrap();
        StationCatalogue::from_stations(stations)
    }

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
  <title>Weginformationen</title>
  <item>
    <title>Bauarbeiten - Zugausfall: Wien Meidling Bahnhof - Mödling</title>
    <description>Schienenersatzverkehr zwischen Wien Meidling und M&#246;dling.</description>
    <link>https://fahrplan.oebb.at/info/1</link>
    <guid>oebb-1</guid>
    <pubDate>Sun, 01 Jun 2025 07:00:00 +0000</pubDate>
  </item>
  <item>
    <title>Störung: Linz Hbf - Salzburg Hbf</title>
    <description>Verzögerungen im Fernverkehr.</description>
    <link>https://fahrplan.oebb.at/info/2</link>
    <guid>oebb-2</guid>
    <pubDate>Sun, 01 Jun 2025 08:00:00 +0000</pubDate>
  </item>
  <item>
    <title>Aufzug außer Betrieb: Wien Praterstern</title>
    <description>Der Aufzug zum Bahnsteig 3 ist gestört.</description>
    <link>https://fahrplan.oebb.at/info/3</link>
    <guid>oebb-3</guid>
    <pubDate>Sun, 01 Jun 2025 09:00:00 +0000</pubDate>
  </item>
</channel></rss>"#;

    #[test]
    fn test_parse_feed_filters_and_tidies() {
        let now = Utc::now();
        let events = parse_feed(FEED, &catalogue(), now);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.guid, "oebb-1");
        assert_eq!(ev.title, "Wien Meidling ↔ Mödling");
        assert!(ev.description.contains("Schienenersatzverkehr"));
        assert_eq!(ev.source, SOURCE);
        assert!(ev.starts_at.is_some());
        assert!(ev.ends_at.is_none());
    }

    #[test]
    fn test_tidy_title_labels_and_noise() {
        assert_eq!(
            tidy_title("Bauarbeiten - Zugausfall: Wien Meidling Bahnhof - Mödling"),
            "Wien Meidling ↔ Mödling"
        );
        assert_eq!(
            tidy_title("Störung: Wien Hütteldorf (U4) - Purkersdorf"),
            "Wien Hütteldorf ↔ Purkersdorf"
        );
        assert_eq!(
            tidy_title("Wien Floridsdorf bzw. Wien Leopoldau"),
            "Wien ↔ Floridsdorf/Wien Leopoldau"
        );
        // A label-only title keeps its original text
        assert_eq!(tidy_title("Bauarbeiten:"), "Bauarbeiten:");
    }

    #[test]
    fn test_region_relevance() {
        let c = catalogue();
        assert!(is_region_relevant(&c, "Störung in Wien", ""));
        assert!(!is_region_relevant(&c, "Störung Wien - Salzburg", ""));
        assert!(is_region_relevant(&c, "Einschränkung", "bei Wien Meidling"));
        assert!(!is_region_relevant(&c, "Einschränkung", "bei Attnang-Puchheim"));
    }

    #[test]
    fn test_missing_guid_gets_stable_hash() {
        let xml = r#"<rss><channel><item>
            <title>Störung Wien Hbf</title>
            <description>Kurze Verzögerungen.</description>
            <pubDate>Sun, 01 Jun 2025 07:00:00 +0000</pubDate>
        </item></channel></rss>"#;
        let a = parse_feed(xml, &catalogue(), Utc::now());
        let b = parse_feed(xml, &catalogue(), Utc::now());
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].guid, b[0].guid);
        assert_eq!(a[0].guid.len(), 64);
    }

    #[test]
    fn test_candidate_urls_configured_first() {
        let config = OebbConfig {
            enabled: true,
            rss_url: Some("https://secret.example.org/feed".into()),
            alt_urls: vec!["https://alt.example.org/feed".into()],
            http_timeout: std::time::Duration::from_secs(15),
        };
        let urls = candidate_urls(&config);
        assert_eq!(urls[0], "https://secret.example.org/feed");
        assert!(urls.contains(&"https://alt.example.org/feed".to_string()));
        let unique: std::collections::HashSet<_> = urls.iter().collect();
        assert_eq!(unique.len(), urls.len());
    }
}
