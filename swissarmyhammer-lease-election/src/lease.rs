//! Lease record wire format
//!
//! The record stored at `<leader_path>/leader_lease` is plain text:
//!
//! ```text
//! <expiration_us>[#_#<progress_key>]
//! <opaque application payload, any number of lines>
//! ```
//!
//! Only the first line is interpreted. The payload is whatever the current
//! holder last set through `set_lease_info` and is re-embedded on every write.

use crate::error::{ElectionError, Result};

/// Separator between the expiration and the progress key on the first line
pub const PROGRESS_KEY_SEPARATOR: &str = "#_#";

/// Decoded lease record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Wall-clock microseconds until which the holder is leader
    pub expiration_us: i64,
    /// Progress key of the holder, `None` when the feature is disabled
    pub progress_key: Option<String>,
    /// Everything after the first line, verbatim
    pub payload: String,
}

impl LeaseRecord {
    /// Encode a lease record
    ///
    /// An empty progress key is treated as disabled and omitted.
    pub fn encode(expiration_us: i64, progress_key: Option<&str>, payload: &str) -> String {
        match progress_key.filter(|key| !key.is_empty()) {
            Some(key) => format!(
                "{}{}{}\n{}",
                expiration_us, PROGRESS_KEY_SEPARATOR, key, payload
            ),
            None => format!("{}\n{}", expiration_us, payload),
        }
    }

    /// Decode a lease record
    ///
    /// Trailing lines never cause a failure.
    pub fn decode(text: &str) -> Result<Self> {
        let (first_line, payload) = match text.split_once('\n') {
            Some((first, rest)) => (first, rest),
            None => (text, ""),
        };
        let first_line = first_line.trim_end_matches('\r');

        let fields: Vec<&str> = first_line.split(PROGRESS_KEY_SEPARATOR).collect();
        let (expiration, progress_key) = match fields.as_slice() {
            [expiration] => (*expiration, None),
            [expiration, key] => (*expiration, Some(*key)),
            _ => {
                return Err(ElectionError::malformed(
                    first_line,
                    format!("expected 1 or 2 fields, found {}", fields.len()),
                ))
            }
        };

        let expiration_us = expiration.trim().parse::<i64>().map_err(|e| {
            ElectionError::malformed(first_line, format!("invalid expiration: {}", e))
        })?;

        Ok(Self {
            expiration_us,
            progress_key: progress_key.filter(|key| !key.is_empty()).map(str::to_string),
            payload: payload.to_string(),
        })
    }

    /// Whether this record still excludes a candidate at `now_us`
    ///
    /// A record excludes everyone until it expires, except a candidate
    /// presenting the same (enabled) progress key: that candidate is the
    /// holder's own continuation.
    pub fn blocks(&self, now_us: i64, my_progress_key: Option<&str>) -> bool {
        if now_us > self.expiration_us {
            return false;
        }
        match my_progress_key {
            Some(mine) => self.progress_key.as_deref() != Some(mine),
            None => true,
        }
    }
}
