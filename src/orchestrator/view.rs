//! Rendered-view filtering.
//!
//! The raw store keeps every attempt of a regeneration chain for audit; the
//! rendered view hides assistant messages that were superseded by a later
//! attempt in the same chain, so the user sees only the SQL that was finally
//! executed (or the terminal fallback).

use std::collections::HashMap;

use crate::store::StoredMessage;

/// Filters the message log down to what the presentation layer shows.
///
/// An assistant message carrying SQL is hidden when another assistant message
/// in the same query group has a higher attempt number. Everything else
/// passes through unchanged, in order.
pub fn rendered_view(messages: &[StoredMessage]) -> Vec<&StoredMessage> {
    let mut latest_attempt: HashMap<i64, i64> = HashMap::new();

    for message in messages {
        if !message.has_sql() {
            continue;
        }
        if let (Some(group), Some(attempt)) = (message.query_group_id, message.attempt) {
            let entry = latest_attempt.entry(group).or_insert(attempt);
            if attempt > *entry {
                *entry = attempt;
            }
        }
    }

    messages
        .iter()
        .filter(|message| {
            if !message.has_sql() {
                return true;
            }
            match (message.query_group_id, message.attempt) {
                (Some(group), Some(attempt)) => {
                    latest_attempt.get(&group).copied().unwrap_or(attempt) == attempt
                }
                _ => true,
            }
        })
        .collect()
}
