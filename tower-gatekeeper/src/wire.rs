//! Multipart framing of the governor's control and accounting channels.
//!
//! Control (governor to filter, subscribed by topic):
//! `[domain "\0", "DELAY_UNTIL", identifier, millis]`
//!
//! Accounting (filter to governor):
//! `[domain "\0", status, identifier, received_millis, delay_millis | "", log_info]`

use std::fmt;

use bytes::Bytes;
use delay_store::MAX_KEY_LEN;

pub const DELAY_UNTIL: &str = "DELAY_UNTIL";

pub const RESYNC: &str = "RESYNC";

/// Number of parts in a control message.
pub const CONTROL_PARTS: usize = 4;

/// Largest accepted control part.
pub const MAX_PART_LEN: usize = MAX_KEY_LEN;

/// Subscription topic for `domain`.
///
/// The trailing NUL stops `api` from matching updates for `apiv2`.
pub fn topic(domain: &str) -> String {
    format!("{domain}\0")
}

/// A decoded control-plane update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    DelayUntil {
        domain: String,
        identifier: String,
        until: u64,
    },
}

impl ControlMessage {
    pub fn to_frames(&self) -> Vec<Bytes> {
        match self {
            Self::DelayUntil {
                domain,
                identifier,
                until,
            } => vec![
                Bytes::from(topic(domain)),
                Bytes::from_static(DELAY_UNTIL.as_bytes()),
                Bytes::copy_from_slice(identifier.as_bytes()),
                Bytes::from(until.to_string()),
            ],
        }
    }
}

/// Why a control message was discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("control message has more than 4 parts")]
    TooManyParts,

    #[error("control message has {0} parts, expected 4")]
    TooFewParts(usize),

    #[error("part {index} is {len} bytes; limit is 256")]
    PartTooLong { index: usize, len: usize },

    #[error("part {0} is not valid UTF-8")]
    NotUtf8(usize),

    #[error("unknown control command '{0}'")]
    UnknownCommand(String),

    #[error("invalid timestamp '{0}'")]
    BadTimestamp(String),
}

/// Decodes one multipart control message.
///
/// Parts are read one at a time into a fixed four-slot buffer; the bound is
/// checked before a part is stored, so a fifth part is refused without ever
/// being copied. Nothing is returned for a malformed message, so callers can
/// never apply half of one.
pub fn decode_control<B: AsRef<[u8]>>(frames: &[B]) -> Result<ControlMessage, DecodeError> {
    let mut parts: [&[u8]; CONTROL_PARTS] = [&[]; CONTROL_PARTS];
    let mut count = 0;

    for (index, frame) in frames.iter().enumerate() {
        if index >= CONTROL_PARTS {
            return Err(DecodeError::TooManyParts);
        }
        let frame = frame.as_ref();
        if frame.len() > MAX_PART_LEN {
            return Err(DecodeError::PartTooLong {
                index,
                len: frame.len(),
            });
        }
        parts[index] = frame;
        count = index + 1;
    }
    if count < CONTROL_PARTS {
        return Err(DecodeError::TooFewParts(count));
    }

    let domain = text(parts, 0)?;
    let domain = domain.strip_suffix('\0').unwrap_or(domain);
    let command = text(parts, 1)?;
    if command != DELAY_UNTIL {
        return Err(DecodeError::UnknownCommand(command.to_string()));
    }
    let identifier = text(parts, 2)?;
    let until = parse_timestamp(text(parts, 3)?)?;

    Ok(ControlMessage::DelayUntil {
        domain: domain.to_string(),
        identifier: identifier.to_string(),
        until,
    })
}

fn text(parts: [&[u8]; CONTROL_PARTS], index: usize) -> Result<&str, DecodeError> {
    std::str::from_utf8(parts[index]).map_err(|_| DecodeError::NotUtf8(index))
}

/// Parses decimal milliseconds.
///
/// A fractional part is accepted and truncated; some governors emit
/// floating-point milliseconds.
fn parse_timestamp(raw: &str) -> Result<u64, DecodeError> {
    let bad = || DecodeError::BadTimestamp(raw.to_string());
    if !raw.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(bad());
    }
    if let Ok(ms) = raw.parse::<u64>() {
        return Ok(ms);
    }
    let (whole, frac) = raw.split_once('.').ok_or_else(bad)?;
    if whole.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    whole.parse::<u64>().map_err(|_| bad())
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accepted,
    Delayed,
    Rejected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Delayed => "DELAYED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decision, as reported to the governor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingEvent {
    pub domain: String,
    pub verdict: Verdict,
    pub identifier: String,
    pub received_at: u64,
    /// Only set for [`Verdict::Delayed`].
    pub delay_until: Option<u64>,
    pub log_info: String,
}

impl AccountingEvent {
    pub fn to_frames(&self) -> Vec<Bytes> {
        vec![
            Bytes::from(topic(&self.domain)),
            Bytes::from_static(self.verdict.as_str().as_bytes()),
            Bytes::copy_from_slice(self.identifier.as_bytes()),
            Bytes::from(self.received_at.to_string()),
            self.delay_until
                .map(|ts| Bytes::from(ts.to_string()))
                .unwrap_or_default(),
            Bytes::copy_from_slice(self.log_info.as_bytes()),
        ]
    }
}

/// Asks the governor to re-push every active delay for `domain`.
pub fn resync_frames(domain: &str) -> Vec<Bytes> {
    vec![
        Bytes::from(topic(domain)),
        Bytes::from_static(RESYNC.as_bytes()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    #[test]
    fn it_decodes_delay_until() {
        let msg = decode_control(&frames(&["api\0", "DELAY_UNTIL", "1.2.3.4", "20000"]));
        assert_eq!(
            msg,
            Ok(ControlMessage::DelayUntil {
                domain: "api".into(),
                identifier: "1.2.3.4".into(),
                until: 20_000,
            })
        );
    }

    #[test]
    fn test_domain_terminator_is_optional() {
        let msg = decode_control(&frames(&["api", "DELAY_UNTIL", "k", "1"])).unwrap();
        let ControlMessage::DelayUntil { domain, .. } = msg;
        assert_eq!(domain, "api");
    }

    #[test]
    fn test_fifth_part_is_refused() {
        let msg = decode_control(&frames(&["api", "DELAY_UNTIL", "k", "1", "extra"]));
        assert_eq!(msg, Err(DecodeError::TooManyParts));
    }

    #[test]
    fn test_short_message_is_refused() {
        assert_eq!(
            decode_control(&frames(&["api", "DELAY_UNTIL", "k"])),
            Err(DecodeError::TooFewParts(3))
        );
        assert_eq!(
            decode_control::<Bytes>(&[]),
            Err(DecodeError::TooFewParts(0))
        );
    }

    #[test]
    fn test_unknown_command_is_refused() {
        assert_eq!(
            decode_control(&frames(&["api", "FOO", "k", "1"])),
            Err(DecodeError::UnknownCommand("FOO".into()))
        );
    }

    #[test]
    fn test_oversized_part_is_refused() {
        let long = "x".repeat(MAX_PART_LEN + 1);
        assert_eq!(
            decode_control(&frames(&["api", "DELAY_UNTIL", &long, "1"])),
            Err(DecodeError::PartTooLong {
                index: 2,
                len: MAX_PART_LEN + 1
            })
        );
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(parse_timestamp("1700000000123"), Ok(1_700_000_000_123));
        assert_eq!(parse_timestamp("20000.75"), Ok(20_000));
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("-5").is_err());
        assert!(parse_timestamp("+5").is_err());
        assert!(parse_timestamp("+5.9").is_err());
        assert!(parse_timestamp("1e9").is_err());
        assert!(parse_timestamp(".5").is_err());
        assert!(parse_timestamp("12.x").is_err());
    }

    #[test]
    fn test_accounting_frames() {
        let accepted = AccountingEvent {
            domain: "api".into(),
            verdict: Verdict::Accepted,
            identifier: "1.2.3.4".into(),
            received_at: 1_000,
            delay_until: None,
            log_info: "GET /".into(),
        };
        assert_eq!(
            accepted.to_frames(),
            frames(&["api\0", "ACCEPTED", "1.2.3.4", "1000", "", "GET /"])
        );

        let delayed = AccountingEvent {
            verdict: Verdict::Delayed,
            delay_until: Some(1_500),
            log_info: String::new(),
            ..accepted
        };
        assert_eq!(
            delayed.to_frames(),
            frames(&["api\0", "DELAYED", "1.2.3.4", "1000", "1500", ""])
        );
    }

    #[test]
    fn test_control_frames_decode() {
        let msg = ControlMessage::DelayUntil {
            domain: "web".into(),
            identifier: "key".into(),
            until: 42,
        };
        assert_eq!(decode_control(&msg.to_frames()), Ok(msg));
        assert_eq!(resync_frames("web"), frames(&["web\0", "RESYNC"]));
    }
}
