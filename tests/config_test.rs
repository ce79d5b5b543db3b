//! Configuration snapshot tests
//!
//! These touch process environment variables, so they run serially.

use std::path::PathBuf;

use serial_test::serial;
use wienfeed::config::{validate_path, Config};

fn clear_env() {
    for var in [
        "LOG_LEVEL",
        "LOG_FORMAT",
        "LOG_DIR",
        "OUT_PATH",
        "STATE_PATH",
        "STATIONS_PATH",
        "FEED_TTL",
        "MAX_ITEMS",
        "MAX_ITEM_AGE_DAYS",
        "ABSOLUTE_MAX_AGE_DAYS",
        "ENDS_AT_GRACE_MINUTES",
        "DESCRIPTION_CHAR_LIMIT",
        "FRESH_PUBDATE_WINDOW_MIN",
        "PROVIDER_TIMEOUT",
        "PROVIDER_MAX_WORKERS",
        "WL_ENABLE",
        "OEBB_ENABLE",
        "VOR_ENABLE",
        "VOR_ACCESS_ID",
        "VOR_STATION_IDS",
        "VOR_ROTATION_MINUTES",
        "VOR_DAILY_BUDGET",
        "WL_BUS_EXCLUDE_RE",
    ] {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn defaults_match_documentation() {
    clear_env();
    let config = Config::from_env(PathBuf::from("/repo")).unwrap();

    assert_eq!(config.feed.ttl_minutes, 15);
    assert_eq!(config.feed.description_char_limit, 170);
    assert_eq!(config.feed.max_items, 10);
    assert_eq!(config.feed.max_item_age_days, 365);
    assert_eq!(config.feed.absolute_max_age_days, 540);
    assert_eq!(config.feed.ends_at_grace_minutes, 10);
    assert_eq!(config.feed.fresh_pubdate_window_min, 5);
    assert_eq!(config.runtime.provider_timeout.as_secs(), 25);
    assert_eq!(config.state_retention_days, 60);
    assert_eq!(config.out_path, PathBuf::from("/repo/docs/feed.xml"));
    assert_eq!(config.state_path, PathBuf::from("/repo/data/first_seen.json"));

    assert!(config.wl.enabled);
    assert!(config.oebb.enabled);
    assert!(config.vor.enabled);
    assert_eq!(config.vor.daily_budget, 100);
    assert_eq!(config.vor.max_requests_per_run, 10);
    assert_eq!(config.vor.rotation.as_secs(), 30 * 60);
}

#[test]
#[serial]
fn invalid_values_fall_back_without_panicking() {
    clear_env();
    std::env::set_var("MAX_ITEMS", "viele");
    std::env::set_var("FEED_TTL", "-3");
    std::env::set_var("WL_ENABLE", "vielleicht");

    let config = Config::from_env(PathBuf::from("/repo")).unwrap();
    assert_eq!(config.feed.max_items, 10);
    assert_eq!(config.feed.ttl_minutes, 0); // negatives clamp to zero
    assert!(config.wl.enabled); // invalid boolean keeps the default

    clear_env();
}

#[test]
#[serial]
fn out_path_outside_allowlist_is_fatal() {
    clear_env();
    std::env::set_var("OUT_PATH", "/tmp/feed.xml");
    assert!(Config::from_env(PathBuf::from("/repo")).is_err());

    std::env::set_var("OUT_PATH", "../feed.xml");
    assert!(Config::from_env(PathBuf::from("/repo")).is_err());

    std::env::set_var("OUT_PATH", "docs/nested/feed.xml");
    assert!(Config::from_env(PathBuf::from("/repo")).is_ok());
    clear_env();
}

#[test]
#[serial]
fn invalid_bus_regex_is_fatal() {
    clear_env();
    std::env::set_var("WL_BUS_EXCLUDE_RE", "([broken");
    assert!(Config::from_env(PathBuf::from("/repo")).is_err());

    std::env::set_var("WL_BUS_EXCLUDE_RE", r"^\d{1,3}[AB]$");
    let config = Config::from_env(PathBuf::from("/repo")).unwrap();
    assert!(config.wl.bus_exclude.is_some());
    clear_env();
}

#[test]
#[serial]
fn station_id_list_is_parsed_as_opaque_strings() {
    clear_env();
    std::env::set_var("VOR_STATION_IDS", "490101200, 8100514,at:49:1234");
    let config = Config::from_env(PathBuf::from("/repo")).unwrap();
    assert_eq!(
        config.vor.station_ids,
        vec!["490101200", "8100514", "at:49:1234"]
    );
    clear_env();
}

#[test]
fn validate_path_covers_all_roots() {
    let base = std::path::Path::new("/repo");
    for ok in ["docs/feed.xml", "data/vor/events.json", "log/wienfeed.log"] {
        assert!(validate_path(base, std::path::Path::new(ok), "TEST").is_ok());
    }
    for bad in ["src/lib.rs", "/etc/hosts", "data/../../x"] {
        assert!(validate_path(base, std::path::Path::new(bad), "TEST").is_err());
    }
}
