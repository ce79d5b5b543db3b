//! Text normalisation for upstream payloads and RSS output
//!
//! Upstream messages arrive as HTML fragments with inconsistent whitespace,
//! entities and control characters. This module converts them to plain text
//! with a uniform bullet separator, clips descriptions on sentence or word
//! boundaries, renders the human-readable time phrase for the description's
//! second line, and provides the XML/CDATA helpers for the emitter.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use chrono_tz::Europe::Vienna;
use regex::Regex;

/// Ellipsis appended when a description is clipped.
const ELLIPSIS: &str = " …";

/// Interval spans longer than this are rendered open-ended.
const OPEN_END_SPAN_DAYS: i64 = 180;

static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<\s*br\s*/?\s*>").unwrap());
static BLOCK_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)</\s*(p|div|li|ul|ol|h\d|table|tr|td|th)\s*>").unwrap());
static BLOCK_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*(p|div|ul|ol|h\d|table|tr|td|th)\b[^>]*>").unwrap());
static LI_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<\s*li\b[^>]*>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<[^>]+>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\r\x0b\x0c]+").unwrap());
static MULTI_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());
static PREP_BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bei|in|an|auf)\s*•\s*").unwrap());
static DIGIT_LETTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)([A-Za-zÄÖÜäöüß])").unwrap());
static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?…](\s|$)").unwrap());
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").unwrap());

/// Convert an HTML fragment to single-line plain text with `•` separators.
///
/// Line breaks introduced by `<br>`, closing block tags and list items are
/// collapsed into bullet-separated segments; the leading segment keeps no
/// bullet.
pub fn html_to_text(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let mut txt = html_escape::decode_html_entities(s).to_string();
    txt = BR_RE.replace_all(&txt, "\n").into_owned();
    txt = BLOCK_CLOSE_RE.replace_all(&txt, "\n").into_owned();
    txt = LI_OPEN_RE.replace_all(&txt, "• ").into_owned();
    txt = BLOCK_OPEN_RE.replace_all(&txt, "").into_owned();
    txt = TAG_RE.replace_all(&txt, "").into_owned();

    // Bullet directly glued to a word gets breathing room
    let mut spaced = String::with_capacity(txt.len());
    let mut prev_non_space = false;
    for ch in txt.chars() {
        if ch == '•' && prev_non_space {
            spaced.push(' ');
        }
        prev_non_space = !ch.is_whitespace();
        spaced.push(ch);
    }
    txt = spaced;

    let lines: Vec<&str> = txt
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let mut joined = String::new();
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            joined.push_str(line);
        } else if line.starts_with('•') {
            joined.push(' ');
            joined.push_str(line);
        } else {
            joined.push_str(" • ");
            joined.push_str(line);
        }
    }
    let mut txt = joined.trim_start_matches(['•', ' ']).to_string();

    txt = DIGIT_LETTER_RE.replace_all(&txt, "$1 $2").into_owned();
    txt = WS_RE.replace_all(&txt, " ").into_owned();
    txt = MULTI_SPACE_RE.replace_all(&txt, " ").trim().to_string();
    PREP_BULLET_RE.replace_all(&txt, "$1 ").into_owned()
}

/// Remove all HTML tags without touching the remaining text.
pub fn strip_tags(s: &str) -> String {
    TAG_RE.replace_all(s, "").into_owned()
}

/// Remove control characters (keeping `\n` and `\t`) and ANSI sequences.
pub fn sanitize_text(s: &str) -> String {
    let without_ansi = ANSI_RE.replace_all(s, "");
    without_ansi
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Collapse runs of horizontal whitespace to single spaces and trim.
pub fn collapse_ws(s: &str) -> String {
    WS_RE.replace_all(s, " ").trim().to_string()
}

/// Clip `text` to at most `limit` characters, breaking on a sentence end or
/// word boundary and appending a single ellipsis. Never cuts inside a word.
/// HTML in the input is unescaped and stripped first; a limit of 0 disables
/// clipping.
pub fn clip_text(text: &str, limit: usize) -> String {
    let plain = html_escape::decode_html_entities(&strip_tags(text)).into_owned();
    let chars: Vec<char> = plain.chars().collect();
    if limit == 0 || chars.len() <= limit {
        return plain;
    }
    let prefix: String = chars[..limit].iter().collect();

    let mut candidates: Vec<usize> = Vec::new();
    for m in SENTENCE_END_RE.find_iter(&prefix) {
        // Keep the punctuation, drop the following whitespace
        let end = m.start() + prefix[m.start()..].chars().next().map_or(1, char::len_utf8);
        candidates.push(end);
    }
    for (idx, ch) in prefix.char_indices() {
        if ch.is_whitespace() && idx > 0 {
            candidates.push(idx);
        }
    }
    // The cut may also fall exactly on a natural boundary
    let next_char = chars.get(limit);
    if let Some(c) = next_char {
        if c.is_whitespace() || ".,;:!?…".contains(*c) {
            candidates.push(prefix.len());
        }
    }

    let clip_pos = candidates.into_iter().max();
    let truncated = match clip_pos {
        Some(pos) if pos > 0 => prefix[..pos].trim_end().to_string(),
        _ => prefix.trim_end().to_string(),
    };
    let truncated = if truncated.is_empty() {
        prefix.trim_end().to_string()
    } else {
        truncated
    };
    format!("{truncated}{ELLIPSIS}")
}

// ============================================================================
// Time phrase
// ============================================================================

/// Render the Vienna-local time phrase for the description's second line.
///
/// Rules (day boundaries evaluated in Europe/Vienna):
/// - both endpoints on the same future day → `Am DD.MM.YYYY`
/// - both present with a real span → `DD.MM.YYYY – DD.MM.YYYY`
/// - start in the past, or end absent/not after start → `Seit DD.MM.YYYY`
/// - start strictly in the future → `Ab DD.MM.YYYY`
/// - only an end → `bis DD.MM.YYYY`
///
/// Spans longer than ~half a year are treated as open-ended.
pub fn format_time_phrase(
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    let start_local = starts_at.map(|dt| dt.with_timezone(&Vienna));
    let mut end_local = ends_at.map(|dt| dt.with_timezone(&Vienna));

    if let (Some(s), Some(e)) = (start_local, end_local) {
        if (e - s).num_days() > OPEN_END_SPAN_DAYS {
            end_local = None;
        }
    }

    let today = now.with_timezone(&Vienna).date_naive();
    let fmt = |d: chrono::NaiveDate| d.format("%d.%m.%Y").to_string();

    match (start_local, end_local) {
        (Some(s), Some(e)) => {
            let s_day = s.date_naive();
            let e_day = e.date_naive();
            if s_day == e_day && s_day > today {
                format!("Am {}", fmt(s_day))
            } else if e <= s {
                if s_day > today {
                    format!("Ab {}", fmt(s_day))
                } else {
                    format!("Seit {}", fmt(s_day))
                }
            } else if s_day == e_day {
                format!("Seit {}", fmt(s_day))
            } else {
                format!("{} – {}", fmt(s_day), fmt(e_day))
            }
        }
        (Some(s), None) => {
            let s_day = s.date_naive();
            if s_day > today {
                format!("Ab {}", fmt(s_day))
            } else {
                format!("Seit {}", fmt(s_day))
            }
        }
        (None, Some(e)) => format!("bis {}", fmt(e.date_naive())),
        (None, None) => String::new(),
    }
}

// ============================================================================
// XML helpers
// ============================================================================

/// Escape text for use outside CDATA sections.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Wrap text in a CDATA section, splitting any embedded `]]>`.
pub fn cdata(s: &str) -> String {
    let safe = s.replace("]]>", "]]]]><![CDATA[>");
    format!("<![CDATA[{safe}]]>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_html_to_text_bullets() {
        let html = "<p>U4 gesperrt</p><ul><li>Ersatzverkehr</li><li>Umleitung</li></ul>";
        assert_eq!(html_to_text(html), "U4 gesperrt • Ersatzverkehr • Umleitung");
    }

    #[test]
    fn test_html_to_text_entities_and_breaks() {
        let html = "St&ouml;rung<br/>Dauer: l&auml;nger";
        assert_eq!(html_to_text(html), "Störung • Dauer: länger");
    }

    #[test]
    fn test_html_to_text_preposition_bullet() {
        // "bei • Karlsplatz" reads as "bei Karlsplatz"
        let html = "Sperre bei<br/>Karlsplatz";
        assert_eq!(html_to_text(html), "Sperre bei Karlsplatz");
    }

    #[test]
    fn test_sanitize_text_strips_controls() {
        let dirty = "Hallo\x00Welt\x07\tTab\nZeile\x1b[31mrot";
        let clean = sanitize_text(dirty);
        assert!(!clean.contains('\x00'));
        assert!(!clean.contains('\x07'));
        assert!(!clean.contains('\x1b'));
        assert!(clean.contains('\t'));
        assert!(clean.contains('\n'));
    }

    #[test]
    fn test_clip_respects_word_boundary() {
        let text = "Schienenersatzverkehr zwischen Meidling und Liesing wegen Bauarbeiten";
        let clipped = clip_text(text, 40);
        assert!(clipped.ends_with(ELLIPSIS));
        let body = clipped.trim_end_matches(ELLIPSIS);
        assert!(text.starts_with(body));
        // No mid-word cut: the clipped body must end exactly at a word
        assert!(text[body.len()..].starts_with(' ') || body.ends_with('.'));
    }

    #[test]
    fn test_clip_sentence_end_when_word_would_be_cut() {
        let text = "Kurzer Satz. Danach folgt eine sehr lange Fortsetzung ohne Ende";
        let clipped = clip_text(text, 17);
        assert_eq!(clipped, "Kurzer Satz. …");
    }

    #[test]
    fn test_clip_short_text_untouched() {
        assert_eq!(clip_text("kurz", 170), "kurz");
        assert_eq!(clip_text("kein Limit", 0), "kein Limit");
    }

    #[test]
    fn test_time_phrase_range() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let s = Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap();
        let e = Utc.with_ymd_and_hms(2025, 6, 3, 19, 0, 0).unwrap();
        assert_eq!(
            format_time_phrase(Some(s), Some(e), now),
            "01.06.2025 – 03.06.2025"
        );
    }

    #[test]
    fn test_time_phrase_single_future_day() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let s = Utc.with_ymd_and_hms(2025, 6, 10, 7, 0, 0).unwrap();
        let e = Utc.with_ymd_and_hms(2025, 6, 10, 19, 0, 0).unwrap();
        assert_eq!(format_time_phrase(Some(s), Some(e), now), "Am 10.06.2025");
    }

    #[test]
    fn test_time_phrase_seit_and_ab() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let past = Utc.with_ymd_and_hms(2025, 5, 20, 7, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2025, 7, 1, 7, 0, 0).unwrap();
        assert_eq!(format_time_phrase(Some(past), None, now), "Seit 20.05.2025");
        assert_eq!(format_time_phrase(Some(future), None, now), "Ab 01.07.2025");
        // end before start counts as open-ended
        assert_eq!(
            format_time_phrase(Some(past), Some(past - chrono::Duration::days(1)), now),
            "Seit 20.05.2025"
        );
    }

    #[test]
    fn test_time_phrase_long_span_open_ended() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let s = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let e = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(format_time_phrase(Some(s), Some(e), now), "Seit 01.05.2025");
    }

    #[test]
    fn test_time_phrase_vienna_day_boundary() {
        // 23:30 UTC on the 1st is already the 2nd in Vienna (summer, UTC+2)
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let s = Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap();
        assert_eq!(format_time_phrase(Some(s), None, now), "Ab 02.06.2025");
    }

    #[test]
    fn test_cdata_splitting() {
        let tricky = "text ]]> more";
        let wrapped = cdata(tricky);
        assert!(wrapped.starts_with("<![CDATA["));
        assert!(wrapped.ends_with("]]>"));
        assert!(!wrapped.contains("text ]]> more"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b&c>\"d\""), "a&lt;b&amp;c&gt;&quot;d&quot;");
    }
}
