//! Deduplication with a best-candidate merge policy
//!
//! Events are grouped by their identity (provider key, guid, or content
//! hash). Within a group the kept candidate is chosen by, in order: later
//! end (an active disruption stays visible), newer publication, newer
//! start, longer description, provider precedence, stable input order.
//! Unique sentences from discarded candidates are merged into the winner;
//! the winner's guid and identity are never touched.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::Event;
use crate::text::collapse_ws;

static SENTENCE_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[.!?…]|\s•\s)\s*").unwrap());

/// Compare two candidates for the same identity; `Greater` means `a` wins.
fn compare_candidates(a: &Event, b: &Event) -> Ordering {
    // 1. Later end wins; an absent end counts as the earliest possible
    let end_cmp = a.ends_at.cmp(&b.ends_at);
    if end_cmp != Ordering::Equal {
        return end_cmp;
    }
    // 2. Newer publication, then newer start
    let pub_cmp = a.pub_date.cmp(&b.pub_date);
    if pub_cmp != Ordering::Equal {
        return pub_cmp;
    }
    let start_cmp = a.starts_at.cmp(&b.starts_at);
    if start_cmp != Ordering::Equal {
        return start_cmp;
    }
    // 3. Longer description
    let len_cmp = a.description.len().cmp(&b.description.len());
    if len_cmp != Ordering::Equal {
        return len_cmp;
    }
    // 4. Provider precedence
    a.source_precedence().cmp(&b.source_precedence())
}

/// Append the loser's sentences that the winner does not already carry.
fn merge_description(winner: &mut Event, loser: &Event) {
    if loser.description.is_empty() || loser.description == winner.description {
        return;
    }
    let winner_lower = winner.description.to_lowercase();
    let mut additions: Vec<String> = Vec::new();
    for sentence in SENTENCE_SPLIT_RE.split(&loser.description) {
        let clean = collapse_ws(sentence);
        if clean.len() < 4 {
            continue;
        }
        if winner_lower.contains(&clean.to_lowercase()) {
            continue;
        }
        if additions
            .iter()
            .any(|a| a.to_lowercase() == clean.to_lowercase())
        {
            continue;
        }
        additions.push(clean);
    }
    if additions.is_empty() {
        return;
    }
    let mut merged = winner.description.clone();
    for addition in additions {
        if merged.is_empty() {
            merged = addition;
        } else {
            merged = format!("{merged} • {addition}");
        }
    }
    winner.description = merged;
}

/// Deduplicate by identity, keeping the best candidate of each group.
pub fn dedupe(events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Event> = Vec::with_capacity(events.len());

    for event in events {
        let key = event.identity();
        match seen.get(&key) {
            None => {
                seen.insert(key, out.len());
                out.push(event);
            }
            Some(&idx) => {
                // 5. On full ties the earlier (existing) entry stays
                if compare_candidates(&event, &out[idx]) == Ordering::Greater {
                    let loser = std::mem::replace(&mut out[idx], event);
                    merge_description(&mut out[idx], &loser);
                } else {
                    let loser = event;
                    merge_description(&mut out[idx], &loser);
                }
            }
        }
    }
    out
}
