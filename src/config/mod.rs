//! Configuration management for the feed builder and provider refreshers
//!
//! All configuration comes from environment variables, captured once at
//! process start into an immutable [`Config`] snapshot. Typed helpers parse
//! integers and booleans with safe fallbacks; invalid values are logged
//! (without leaking the raw value of anything credential-shaped) and the
//! documented default is used instead.
//!
//! Every configured file path must resolve inside the path allowlist
//! (`docs/`, `data/`, `log/` under the working directory). Violations are
//! fatal before any I/O happens.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};

/// Directory roots the core is allowed to touch.
pub const ALLOWED_ROOTS: &[&str] = &["docs", "data", "log"];

/// Truthy values accepted by [`get_bool_env`].
const TRUE_VALUES: &[&str] = &["1", "true", "t", "yes", "y", "on"];
const FALSE_VALUES: &[&str] = &["0", "false", "f", "no", "n", "off"];

// ============================================================================
// Typed env helpers
// ============================================================================

/// Read an integer environment variable safely.
///
/// Returns `default` when the variable is unset or cannot be parsed; invalid
/// values produce a warning naming the variable but not echoing its content.
pub fn get_int_env(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, default, "invalid integer value, using default");
                default
            }
        },
    }
}

/// Read a boolean environment variable safely.
///
/// Accepts 1/0, true/false, yes/no, on/off (case-insensitive). Unset or
/// whitespace-only values yield the default; anything else warns and falls
/// back to the default.
pub fn get_bool_env(name: &str, default: bool) -> bool {
    let raw = match std::env::var(name) {
        Err(_) => return default,
        Ok(v) => v,
    };
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return default;
    }
    if TRUE_VALUES.contains(&lowered.as_str()) {
        return true;
    }
    if FALSE_VALUES.contains(&lowered.as_str()) {
        return false;
    }
    warn!(var = name, default, "invalid boolean value, using default");
    default
}

fn get_str_env(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn get_opt_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Path allowlist
// ============================================================================

/// Lexically normalize `path`, rejecting traversal above its root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Ensure `candidate` stays within the allowlisted roots under `base`.
///
/// The check is applied to the lexically normalized absolute path and, for
/// the deepest existing ancestor, again after symlink resolution. Returns
/// the normalized absolute path on success.
pub fn validate_path(base: &Path, candidate: &Path, name: &str) -> Result<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let normalized = normalize(&joined)
        .ok_or_else(|| Error::config(format!("{name} escapes the filesystem root")))?;

    let rel = normalized
        .strip_prefix(base)
        .map_err(|_| Error::config(format!("{name} outside allowed directories")))?;
    let first = rel
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .ok_or_else(|| Error::config(format!("{name} outside allowed directories")))?;
    if !ALLOWED_ROOTS.contains(&first) {
        return Err(Error::config(format!("{name} outside allowed directories")));
    }

    // Symlink resolution on the deepest existing ancestor: a link under
    // data/ pointing outside the repository must not pass. Skipped when
    // nothing below the base exists yet (first run, tests).
    let mut probe = normalized.clone();
    while !probe.exists() {
        if !probe.pop() {
            break;
        }
    }
    if probe.exists() && probe.starts_with(base) && probe != *base {
        let resolved = probe
            .canonicalize()
            .map_err(|e| Error::config(format!("{name}: cannot resolve path ({e})")))?;
        let base_resolved = base
            .canonicalize()
            .map_err(|e| Error::config(format!("working directory unresolvable ({e})")))?;
        if !resolved.starts_with(&base_resolved) {
            return Err(Error::config(format!(
                "{name} resolves outside allowed directories"
            )));
        }
    }

    Ok(normalized)
}

/// Resolve an env-configured path against the allowlist, falling back to
/// `default` when the variable is unset or empty.
pub fn resolve_env_path(base: &Path, env_name: &str, default: &str) -> Result<PathBuf> {
    let raw = get_opt_env(env_name).unwrap_or_else(|| default.to_string());
    validate_path(base, Path::new(&raw), env_name)
}

// ============================================================================
// Config sections
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Log format: "text" or "json"
    pub format: String,
    /// Directory for log files (inside the allowlist)
    pub dir: PathBuf,
    /// Size guard for a single log file
    pub max_bytes: u64,
    /// Number of rotated files to keep
    pub backup_count: u32,
}

/// Feed shape and pruning settings
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub title: String,
    pub link: String,
    pub description: String,
    /// Channel ttl in minutes
    pub ttl_minutes: u32,
    pub description_char_limit: usize,
    pub fresh_pubdate_window_min: i64,
    pub max_items: usize,
    pub max_item_age_days: i64,
    pub absolute_max_age_days: i64,
    pub ends_at_grace_minutes: i64,
}

/// Runtime settings for the build phase
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Per-provider deadline for the cache read
    pub provider_timeout: Duration,
    /// Worker pool bound (0 = available parallelism)
    pub provider_max_workers: usize,
}

/// Wiener Linien provider settings
#[derive(Debug, Clone)]
pub struct WlConfig {
    pub enabled: bool,
    pub base_url: String,
    pub http_timeout: Duration,
    /// Bus lines to keep even when the exclude pattern matches
    pub bus_include: Option<Regex>,
    /// Bus lines to drop from events
    pub bus_exclude: Option<Regex>,
}

/// ÖBB RSS provider settings
#[derive(Debug, Clone)]
pub struct OebbConfig {
    pub enabled: bool,
    pub rss_url: Option<String>,
    pub alt_urls: Vec<String>,
    pub http_timeout: Duration,
}

/// VOR/VAO REST provider settings
#[derive(Debug, Clone)]
pub struct VorConfig {
    pub enabled: bool,
    pub access_id: Option<String>,
    /// Send the credential as a header instead of a query parameter
    pub auth_in_header: bool,
    pub base_url: String,
    pub station_ids: Vec<String>,
    /// Name-based station resolution, used only when `station_ids` is empty
    pub station_names: Vec<String>,
    pub rotation: Duration,
    pub max_stations_per_run: usize,
    pub daily_budget: u32,
    pub max_requests_per_run: u32,
    pub http_timeout: Duration,
}

/// Main configuration snapshot
#[derive(Debug, Clone)]
pub struct Config {
    /// Repository base directory the allowlist is anchored to
    pub base_dir: PathBuf,
    pub logging: LoggingConfig,
    pub feed: FeedSettings,
    pub runtime: RuntimeSettings,
    /// RSS output path (inside docs/)
    pub out_path: PathBuf,
    /// first_seen state file (inside data/)
    pub state_path: PathBuf,
    pub state_retention_days: i64,
    /// Station catalogue file (inside data/)
    pub stations_path: PathBuf,
    /// Pretty-print cache JSON
    pub cache_pretty: bool,
    pub wl: WlConfig,
    pub oebb: OebbConfig,
    pub vor: VorConfig,
}

impl Config {
    /// Capture configuration from the environment, anchored at `base_dir`.
    ///
    /// Path and regex problems are fatal here, before any I/O.
    pub fn from_env(base_dir: PathBuf) -> Result<Self> {
        let logging = LoggingConfig {
            level: get_str_env("LOG_LEVEL", "info").to_lowercase(),
            format: get_str_env("LOG_FORMAT", "text").to_lowercase(),
            dir: resolve_env_path(&base_dir, "LOG_DIR", "log")?,
            max_bytes: get_int_env("LOG_MAX_BYTES", 1_000_000).max(0) as u64,
            backup_count: get_int_env("LOG_BACKUP_COUNT", 5).max(0) as u32,
        };

        let feed = FeedSettings {
            title: get_str_env("FEED_TITLE", "ÖPNV Störungen Wien & Umgebung"),
            link: get_str_env("FEED_LINK", "https://wien.example/oepnv"),
            description: get_str_env(
                "FEED_DESC",
                "Aktive Störungen/Baustellen/Einschränkungen aus offiziellen Quellen",
            ),
            ttl_minutes: get_int_env("FEED_TTL", 15).max(0) as u32,
            description_char_limit: get_int_env("DESCRIPTION_CHAR_LIMIT", 170).max(0) as usize,
            fresh_pubdate_window_min: get_int_env("FRESH_PUBDATE_WINDOW_MIN", 5),
            max_items: get_int_env("MAX_ITEMS", 10).max(0) as usize,
            max_item_age_days: get_int_env("MAX_ITEM_AGE_DAYS", 365).max(0),
            absolute_max_age_days: get_int_env("ABSOLUTE_MAX_AGE_DAYS", 540).max(0),
            ends_at_grace_minutes: get_int_env("ENDS_AT_GRACE_MINUTES", 10).max(0),
        };

        let runtime = RuntimeSettings {
            provider_timeout: Duration::from_secs(get_int_env("PROVIDER_TIMEOUT", 25).max(0) as u64),
            provider_max_workers: get_int_env("PROVIDER_MAX_WORKERS", 0).max(0) as usize,
        };

        let wl = WlConfig {
            enabled: get_bool_env("WL_ENABLE", true),
            base_url: get_str_env("WL_BASE_URL", "https://www.wienerlinien.at/ogd_realtime"),
            http_timeout: Duration::from_secs(get_int_env("WL_HTTP_TIMEOUT", 20).max(1) as u64),
            bus_include: parse_env_regex("WL_BUS_INCLUDE_RE")?,
            bus_exclude: parse_env_regex("WL_BUS_EXCLUDE_RE")?,
        };

        let oebb = OebbConfig {
            enabled: get_bool_env("OEBB_ENABLE", true),
            rss_url: get_opt_env("OEBB_RSS_URL"),
            alt_urls: split_csv(get_opt_env("OEBB_RSS_ALT_URLS")),
            http_timeout: Duration::from_secs(get_int_env("OEBB_HTTP_TIMEOUT", 15).max(1) as u64),
        };

        let vor = VorConfig {
            enabled: get_bool_env("VOR_ENABLE", true),
            access_id: get_opt_env("VOR_ACCESS_ID"),
            auth_in_header: get_bool_env("VOR_AUTH_IN_HEADER", false),
            base_url: get_str_env(
                "VOR_BASE_URL",
                "https://routenplaner.verkehrsauskunft.at/vao/restproxy/v1.3",
            ),
            station_ids: split_csv(get_opt_env("VOR_STATION_IDS")),
            station_names: split_csv(get_opt_env("VOR_STATION_NAMES")),
            rotation: Duration::from_secs(
                get_int_env("VOR_ROTATION_MINUTES", 30).max(1) as u64 * 60,
            ),
            max_stations_per_run: get_int_env("VOR_MAX_STATIONS_PER_RUN", 2).max(1) as usize,
            daily_budget: get_int_env("VOR_DAILY_BUDGET", 100).max(0) as u32,
            max_requests_per_run: get_int_env("VOR_MAX_REQUESTS_PER_RUN", 10).max(1) as u32,
            http_timeout: Duration::from_secs(get_int_env("VOR_HTTP_TIMEOUT", 15).max(1) as u64),
        };

        Ok(Self {
            out_path: resolve_env_path(&base_dir, "OUT_PATH", "docs/feed.xml")?,
            state_path: resolve_env_path(&base_dir, "STATE_PATH", "data/first_seen.json")?,
            state_retention_days: get_int_env("STATE_RETENTION_DAYS", 60).max(0),
            stations_path: resolve_env_path(&base_dir, "STATIONS_PATH", "data/stations.json")?,
            cache_pretty: get_bool_env("CACHE_PRETTY", true),
            base_dir,
            logging,
            feed,
            runtime,
            wl,
            oebb,
            vor,
        })
    }

    /// Sanity warnings for configurations that are valid but produce
    /// surprising feeds.
    pub fn log_sanity_warnings(&self) {
        if self.feed.max_items == 0 {
            warn!("MAX_ITEMS is 0, the feed will be generated without entries");
        }
        if self.feed.ttl_minutes == 0 {
            warn!("FEED_TTL is 0, clients will treat the feed as immediately stale");
        }
        if self.feed.max_item_age_days > self.feed.absolute_max_age_days {
            warn!(
                max_item_age_days = self.feed.max_item_age_days,
                absolute_max_age_days = self.feed.absolute_max_age_days,
                "MAX_ITEM_AGE_DAYS exceeds ABSOLUTE_MAX_AGE_DAYS, the absolute cutoff wins"
            );
        }
        if !self.wl.enabled && !self.oebb.enabled && !self.vor.enabled {
            warn!("all providers disabled, the feed will be empty");
        }
    }
}

fn split_csv(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse an optional regex from the environment. An invalid pattern is a
/// fatal configuration error, not a fallback.
fn parse_env_regex(name: &str) -> Result<Option<Regex>> {
    match get_opt_env(name) {
        None => Ok(None),
        Some(raw) => Regex::new(&raw)
            .map(Some)
            .map_err(|e| Error::config(format!("invalid regex in {name}: {e}"))),
    }
}
