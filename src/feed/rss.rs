//! RSS 2.0 emitter
//!
//! Renders the ordered events into RSS with a small extension namespace
//! (`ext:first_seen`, `ext:starts_at`, `ext:ends_at`, ISO-8601 UTC) and a
//! `content:encoded` mirror of each description. Descriptions live in
//! CDATA with line breaks as `<br/>`; everything outside CDATA is
//! XML-escaped. `pubDate` values are RFC 1123 rendered in Europe/Vienna.

use chrono::{DateTime, Utc};
use chrono_tz::Europe::Vienna;

use crate::config::FeedSettings;
use crate::models::Event;
use crate::storage::FirstSeenMap;
use crate::text::{cdata, clip_text, format_time_phrase, sanitize_text, xml_escape};

/// Namespace the ext: time fields are declared under.
const EXT_NAMESPACE: &str = "https://wienfeed.example/schema";
const CONTENT_NAMESPACE: &str = "http://purl.org/rss/1.0/modules/content/";

fn rfc1123_vienna(dt: DateTime<Utc>) -> String {
    dt.with_timezone(&Vienna)
        .format("%a, %d %b %Y %H:%M:%S %z")
        .to_string()
}

fn iso_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Compose the emitted description: clipped summary line plus the
/// Vienna-local time phrase as a second line when dates are known.
fn compose_description(event: &Event, now: DateTime<Utc>, settings: &FeedSettings) -> String {
    let summary = sanitize_text(&clip_text(
        &event.description,
        settings.description_char_limit,
    ));
    let phrase = format_time_phrase(event.starts_at, event.ends_at, now);
    if phrase.is_empty() {
        summary
    } else if summary.is_empty() {
        phrase
    } else {
        format!("{summary}\n{phrase}")
    }
}

fn emit_item(
    event: &Event,
    now: DateTime<Utc>,
    state: &mut FirstSeenMap,
    settings: &FeedSettings,
    out: &mut String,
) -> String {
    let ident = event.identity();
    let first_seen = state.record(&ident, now);

    let title = sanitize_text(&event.title);
    let link = if event.link.is_empty() {
        settings.link.clone()
    } else {
        event.link.clone()
    };
    let description = compose_description(event, now, settings);
    let desc_html = description.replace('\n', "<br/>");

    out.push_str("<item>\n");
    out.push_str(&format!("<title>{}</title>\n", cdata(&title)));
    out.push_str(&format!("<link>{}</link>\n", xml_escape(&link)));
    out.push_str(&format!(
        "<guid isPermaLink=\"false\">{}</guid>\n",
        xml_escape(&event.guid)
    ));
    out.push_str(&format!(
        "<pubDate>{}</pubDate>\n",
        rfc1123_vienna(event.pub_date)
    ));
    out.push_str(&format!(
        "<ext:first_seen>{}</ext:first_seen>\n",
        iso_utc(first_seen)
    ));
    if let Some(starts_at) = event.starts_at {
        out.push_str(&format!(
            "<ext:starts_at>{}</ext:starts_at>\n",
            iso_utc(starts_at)
        ));
    }
    if let Some(ends_at) = event.ends_at {
        out.push_str(&format!("<ext:ends_at>{}</ext:ends_at>\n", iso_utc(ends_at)));
    }
    out.push_str(&format!(
        "<description>{}</description>\n",
        cdata(&desc_html)
    ));
    out.push_str(&format!(
        "<content:encoded>{}</content:encoded>\n",
        cdata(&desc_html)
    ));
    out.push_str("</item>\n");

    ident
}

/// Render the full feed; returns the XML and the identities actually
/// emitted (at most `max_items`).
pub fn render(
    events: &[Event],
    now: DateTime<Utc>,
    state: &mut FirstSeenMap,
    settings: &FeedSettings,
) -> (String, Vec<String>) {
    let mut out = String::with_capacity(4096);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<rss version=\"2.0\" xmlns:ext=\"{EXT_NAMESPACE}\" xmlns:content=\"{CONTENT_NAMESPACE}\">\n"
    ));
    out.push_str("<channel>\n");
    out.push_str(&format!("<title>{}</title>\n", xml_escape(&settings.title)));
    out.push_str(&format!("<link>{}</link>\n", xml_escape(&settings.link)));
    out.push_str(&format!(
        "<description>{}</description>\n",
        xml_escape(&settings.description)
    ));
    out.push_str(&format!(
        "<lastBuildDate>{}</lastBuildDate>\n",
        rfc1123_vienna(now)
    ));
    out.push_str(&format!("<ttl>{}</ttl>\n", settings.ttl_minutes));

    let mut identities = Vec::new();
    for event in events.iter().take(settings.max_items) {
        identities.push(emit_item(event, now, state, settings, &mut out));
    }

    out.push_str("</channel>\n");
    out.push_str("</rss>\n");
    (out, identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> FeedSettings {
        FeedSettings {
            title: "ÖPNV Störungen Wien & Umgebung".into(),
            link: "https://wien.example/oepnv".into(),
            description: "Aktive Störungen".into(),
            ttl_minutes: 15,
            description_char_limit: 170,
            fresh_pubdate_window_min: 5,
            max_items: 10,
            max_item_age_days: 365,
            absolute_max_age_days: 540,
            ends_at_grace_minutes: 10,
        }
    }

    fn vor_event() -> Event {
        Event {
            source: "VOR/VAO".into(),
            category: "Baustelle".into(),
            title: "S7: Bauarbeiten".into(),
            description: "Schienenersatzverkehr".into(),
            link: "https://www.vor.at/".into(),
            guid: "VOR-42".into(),
            pub_date: Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap(),
            starts_at: Some(Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap()),
            ends_at: Some(Utc.with_ymd_and_hms(2025, 6, 3, 19, 0, 0).unwrap()),
            identity: None,
        }
    }

    #[test]
    fn test_render_single_event() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let mut state = FirstSeenMap::default();
        let (xml, identities) = render(&[vor_event()], now, &mut state, &settings());

        assert!(xml.contains("<guid isPermaLink=\"false\">VOR-42</guid>"));
        assert!(xml.contains(&cdata("Schienenersatzverkehr<br/>01.06.2025 – 03.06.2025")));
        assert!(xml.contains("<ext:starts_at>2025-06-01T07:00:00Z</ext:starts_at>"));
        assert!(xml.contains("<ext:ends_at>2025-06-03T19:00:00Z</ext:ends_at>"));
        assert!(xml.contains(&format!("<ext:first_seen>{}</ext:first_seen>", iso_utc(now))));
        assert!(xml.contains("xmlns:ext="));
        assert!(xml.contains("<ttl>15</ttl>"));

        assert_eq!(identities, vec!["VOR-42".to_string()]);
        assert_eq!(state.get("VOR-42"), Some(now));
    }

    #[test]
    fn test_first_seen_survives_rebuild() {
        let first_build = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let second_build = first_build + chrono::Duration::hours(6);
        let mut state = FirstSeenMap::default();
        render(&[vor_event()], first_build, &mut state, &settings());
        let (xml, _) = render(&[vor_event()], second_build, &mut state, &settings());
        assert!(xml.contains(&format!(
            "<ext:first_seen>{}</ext:first_seen>",
            iso_utc(first_build)
        )));
    }

    #[test]
    fn test_max_items_clip() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let mut state = FirstSeenMap::default();
        let mut cfg = settings();
        cfg.max_items = 2;
        let events: Vec<Event> = (0..5)
            .map(|i| {
                let mut ev = vor_event();
                ev.guid = format!("VOR-{i}");
                ev
            })
            .collect();
        let (xml, identities) = render(&events, now, &mut state, &cfg);
        assert_eq!(identities.len(), 2);
        assert_eq!(xml.matches("<item>").count(), 2);
    }

    #[test]
    fn test_description_clipping_applies() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let mut state = FirstSeenMap::default();
        let mut cfg = settings();
        cfg.description_char_limit = 30;
        let mut ev = vor_event();
        ev.description =
            "Schienenersatzverkehr zwischen Wien Meidling und Mödling wegen Bauarbeiten".into();
        let (xml, _) = render(&[ev], now, &mut state, &cfg);
        assert!(xml.contains(" …"));
    }

    #[test]
    fn test_no_raw_markup_outside_cdata() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let mut state = FirstSeenMap::default();
        let mut cfg = settings();
        cfg.title = "Störungen <Wien> & Umgebung".into();
        let mut ev = vor_event();
        ev.link = "https://example.org/?a=1&b=2".into();
        let (xml, _) = render(&[ev], now, &mut state, &cfg);
        assert!(xml.contains("Störungen &lt;Wien&gt; &amp; Umgebung"));
        assert!(xml.contains("https://example.org/?a=1&amp;b=2"));
    }

    #[test]
    fn test_empty_link_falls_back_to_channel_link() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let mut state = FirstSeenMap::default();
        let mut ev = vor_event();
        ev.link = String::new();
        let (xml, _) = render(&[ev], now, &mut state, &settings());
        assert!(xml.contains("<link>https://wien.example/oepnv</link>"));
    }
}
