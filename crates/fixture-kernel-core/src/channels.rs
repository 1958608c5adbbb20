//! Channel expression codec.
//!
//! Converts a set of channel numbers into the compact form used on paperwork
//! (`"1-5, 21, 45"`) and back.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RejectedToken {
    pub token: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParsedChannels {
    pub channels: Vec<u32>,
    #[serde(default)]
    pub rejected: Vec<RejectedToken>,
}

/// Render channels as ascending tokens joined by `", "`.
///
/// Runs of three or more consecutive channels collapse to `first-last`. A run
/// of exactly two stays as two tokens so `"5, 6"` never reads as one value.
#[must_use]
pub fn format_channels<I>(channels: I) -> String
where
    I: IntoIterator<Item = u32>,
{
    let sorted = channels.into_iter().collect::<BTreeSet<_>>().into_iter().collect::<Vec<_>>();
    let mut tokens: Vec<String> = Vec::new();
    let mut index = 0;

    while index < sorted.len() {
        let start = sorted[index];
        let mut end = start;
        let mut next = index + 1;
        while next < sorted.len() && end.checked_add(1) == Some(sorted[next]) {
            end = sorted[next];
            next += 1;
        }

        match next - index {
            1 => tokens.push(start.to_string()),
            2 => {
                tokens.push(start.to_string());
                tokens.push(end.to_string());
            }
            _ => tokens.push(format!("{start}-{end}")),
        }
        index = next;
    }

    tokens.join(", ")
}

/// Expand an expression into channels in token order.
///
/// Output is neither sorted nor de-duplicated. Unparsable tokens are dropped;
/// use [`parse_channels_with_diagnostics`] to see what was dropped.
#[must_use]
pub fn parse_channels(expression: &str) -> Vec<u32> {
    parse_channels_with_diagnostics(expression).channels
}

#[must_use]
pub fn parse_channels_with_diagnostics(expression: &str) -> ParsedChannels {
    let mut parsed = ParsedChannels::default();

    for raw in expression.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }

        if let Some((start_raw, end_raw)) = token.split_once('-') {
            let (Ok(start), Ok(end)) =
                (start_raw.trim().parse::<u32>(), end_raw.trim().parse::<u32>())
            else {
                reject(&mut parsed, token, "range bounds are not non-negative integers");
                continue;
            };

            if start > end {
                reject(&mut parsed, token, "range is descending");
                continue;
            }

            parsed.channels.extend(start..=end);
            continue;
        }

        match token.parse::<u32>() {
            Ok(channel) => parsed.channels.push(channel),
            Err(_) => reject(&mut parsed, token, "not a non-negative integer"),
        }
    }

    parsed
}

fn reject(parsed: &mut ParsedChannels, token: &str, reason: &str) {
    tracing::debug!(token, reason, "dropping channel token");
    parsed.rejected.push(RejectedToken { token: token.to_string(), reason: reason.to_string() });
}
