//! Regional relevance filter for railway notices
//!
//! Railway feeds cover the whole network; this module decides whether a
//! notice concerns the Vienna region. Relation-style titles
//! ("A ↔ B", "A – B") are split into endpoints which must all be allowed
//! stations; free-form text is scanned with a sliding token window against
//! the station catalogue and checked against a far-away denylist.

use std::sync::LazyLock;

use regex::Regex;

use crate::stations::StationCatalogue;

/// Longest station name considered by the sliding window scan, in tokens.
const MAX_STATION_WINDOW: usize = 4;

static BAHNHOF_TRIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*\b(?:Bahnhof|Bahnhst|Hbf|Bf)\b\.?(?:\s*\(\s*[US]\d*\s*\))?").unwrap()
});
static PAREN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*").unwrap());
static ARROW_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:↔|<=>|<->|→|=>|->|—|–|\s-\s)\s*").unwrap());
static ENDPOINT_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:/|,|bzw\.|oder|und)\s*").unwrap());
static MULTI_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());
static SPACED_DASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s-\s").unwrap());
static TOKEN_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w äöüÄÖÜß]+").unwrap());

/// Cities far outside the region; their presence disqualifies free-form
/// matches that have no explicit Vienna anchor.
static FAR_AWAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(salzburg|innsbruck|villach|bregenz|linz|graz|klagenfurt|bratislava|münchen|muenchen|passau|freilassing|budapest|prag|brno)\b",
    )
    .unwrap()
});

/// Strip station-type noise from an endpoint name.
pub fn clean_endpoint(value: &str) -> String {
    let text = BAHNHOF_TRIM_RE.replace_all(value, "");
    let text = PAREN_RE.replace_all(&text, " ");
    MULTI_SPACE_RE
        .replace_all(&text, " ")
        .trim_matches([' ', ',', '/', '.'])
        .to_string()
}

/// Split a relation-style title into its endpoint names, or `None` when the
/// title carries no relation marker.
pub fn split_endpoints(title: &str) -> Option<Vec<String>> {
    let has_marker = ["↔", "<=>", "<->", "→", "=>", "->", "—", "–"]
        .iter()
        .any(|m| title.contains(m))
        || SPACED_DASH_RE.is_match(title);
    if !has_marker {
        return None;
    }

    let parts: Vec<&str> = ARROW_SPLIT_RE
        .split(title)
        .filter(|p| !p.trim().is_empty())
        .collect();
    if parts.len() < 2 {
        return None;
    }

    let mut endpoints: Vec<String> = Vec::new();
    for segment in &parts[..2] {
        for token in ENDPOINT_SPLIT_RE.split(segment) {
            let name = clean_endpoint(token);
            if !name.is_empty() && !endpoints.contains(&name) {
                endpoints.push(name);
            }
        }
    }
    Some(endpoints)
}

fn is_allowed_station(catalogue: &StationCatalogue, name: &str, only_vienna: bool) -> bool {
    if catalogue.is_in_vienna(name) {
        return true;
    }
    if only_vienna {
        return false;
    }
    catalogue.is_commuter(name)
}

/// Sliding-window scan: does `blob` mention any allowed station?
pub fn has_allowed_station(catalogue: &StationCatalogue, blob: &str, only_vienna: bool) -> bool {
    let tokens: Vec<&str> = TOKEN_SPLIT_RE
        .split(blob)
        .flat_map(|chunk| chunk.split_whitespace())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return false;
    }
    let window = MAX_STATION_WINDOW.min(tokens.len());
    for size in (1..=window).rev() {
        for start in 0..=(tokens.len() - size) {
            let candidate = tokens[start..start + size].join(" ");
            if is_allowed_station(catalogue, &candidate, only_vienna) {
                return true;
            }
        }
    }
    false
}

/// Decide whether a notice stays in the feed.
///
/// Relation titles require *all* endpoints to be allowed; otherwise the
/// combined text must mention an allowed station and no far-away city.
pub fn keep_by_region(
    catalogue: &StationCatalogue,
    title: &str,
    desc: &str,
    only_vienna: bool,
) -> bool {
    if let Some(endpoints) = split_endpoints(title) {
        return endpoints
            .iter()
            .all(|e| is_allowed_station(catalogue, e, only_vienna));
    }
    let blob = format!("{title} {desc}");
    if !has_allowed_station(catalogue, &blob, only_vienna) {
        return false;
    }
    !FAR_AWAY_RE.is_match(&blob)
}

/// Whether the text mentions a far-away city at all.
pub fn mentions_far_away(text: &str) -> bool {
    FAR_AWAY_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stations::Station;

    fn catalogue() -> StationCatalogue {
        let raw = r#"[
            {"bst_id": "1", "name": "Wien Hbf", "aliases": ["Wien Hauptbahnhof"], "in_vienna": true},
            {"bst_id": "2", "name": "Wien Meidling", "in_vienna": true},
            {"bst_id": "3", "name": "Mödling", "pendler": true},
            {"bst_id": "4", "name": "St. Pölten"}
        ]"#;
        let stations: Vec<Station> = serde_json::from_str(raw).unwrap();
        StationCatalogue::from_stations(stations)
    }

    #[test]
    fn test_clean_endpoint() {
        assert_eq!(clean_endpoint("Mödling Bahnhof"), "Mödling");
        assert_eq!(clean_endpoint("Wien Meidling (U6)"), "Wien Meidling");
        assert_eq!(clean_endpoint("Floridsdorf Bf."), "Floridsdorf");
    }

    #[test]
    fn test_split_endpoints() {
        let eps = split_endpoints("Wien Meidling ↔ Mödling").unwrap();
        assert_eq!(eps, vec!["Wien Meidling", "Mödling"]);

        let eps = split_endpoints("Wien Hbf – Mödling/Baden").unwrap();
        assert_eq!(eps, vec!["Wien Hbf", "Mödling", "Baden"]);

        assert!(split_endpoints("Gleisarbeiten in Wien").is_none());
    }

    #[test]
    fn test_keep_relation_all_endpoints_allowed() {
        let c = catalogue();
        assert!(keep_by_region(&c, "Wien Meidling ↔ Mödling", "", false));
        // St. Pölten is neither Vienna nor commuter belt
        assert!(!keep_by_region(&c, "Wien Meidling ↔ St. Pölten", "", false));
        // only_vienna excludes the commuter belt
        assert!(!keep_by_region(&c, "Wien Meidling ↔ Mödling", "", true));
    }

    #[test]
    fn test_keep_freeform_by_station_mention() {
        let c = catalogue();
        assert!(keep_by_region(
            &c,
            "Bauarbeiten",
            "Einschränkungen bei Wien Meidling",
            false
        ));
        assert!(!keep_by_region(&c, "Bauarbeiten", "Region Attnang", false));
    }

    #[test]
    fn test_far_away_disqualifies_freeform() {
        let c = catalogue();
        assert!(!keep_by_region(
            &c,
            "Fernverkehr",
            "Wien Hbf Richtung Salzburg eingeschränkt",
            false
        ));
        assert!(mentions_far_away("Strecke nach Linz"));
        assert!(!mentions_far_away("S-Bahn Stammstrecke"));
    }
}
