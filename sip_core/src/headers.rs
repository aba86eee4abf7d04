//! Parsers for the header values the event engines act on.

use log::warn;

use crate::{Result, SipError};

/// Largest delta-seconds value accepted in `Expires`, `Min-Expires` and
/// `retry-after` (RFC 3261 caps delta-seconds at 2**32-1).
pub const MAX_DELTA_SECONDS: u64 = u32::MAX as u64;

const MAX_ENTITY_TAG_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubState {
    Active,
    Pending,
    Terminated,
    Other(String),
}

/// Termination reasons from RFC 6665 section 4.1.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Deactivated,
    Probation,
    Rejected,
    Timeout,
    Giveup,
    NoResource,
    Invariant,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateHeader {
    pub state: SubState,
    pub reason: Option<TerminationReason>,
    pub expires: Option<u32>,
    pub retry_after: Option<u32>,
    pub params: Vec<(String, Option<String>)>,
}

impl SubState {
    fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "active" => SubState::Active,
            "pending" => SubState::Pending,
            "terminated" => SubState::Terminated,
            other => SubState::Other(other.to_string()),
        }
    }
}

impl TerminationReason {
    fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "deactivated" => TerminationReason::Deactivated,
            "probation" => TerminationReason::Probation,
            "rejected" => TerminationReason::Rejected,
            "timeout" => TerminationReason::Timeout,
            "giveup" => TerminationReason::Giveup,
            "noresource" => TerminationReason::NoResource,
            "invariant" => TerminationReason::Invariant,
            other => TerminationReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TerminationReason::Deactivated => "deactivated",
            TerminationReason::Probation => "probation",
            TerminationReason::Rejected => "rejected",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Giveup => "giveup",
            TerminationReason::NoResource => "noresource",
            TerminationReason::Invariant => "invariant",
            TerminationReason::Other(value) => value.as_str(),
        }
    }
}

impl SubscriptionStateHeader {
    /// Parse a `Subscription-State` value such as
    /// `terminated;reason=giveup;retry-after=30`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.split(';');
        let state = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SipError::Invalid("subscription state"))?;

        let mut header = SubscriptionStateHeader {
            state: SubState::from_token(state),
            reason: None,
            expires: None,
            retry_after: None,
            params: Vec::new(),
        };

        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let mut kv = param.splitn(2, '=');
            let key = kv.next().unwrap_or_default().trim().to_ascii_lowercase();
            let value = kv.next().map(|v| v.trim().trim_matches('"'));
            match (key.as_str(), value) {
                ("reason", Some(v)) => header.reason = Some(TerminationReason::from_token(v)),
                ("expires", Some(v)) => {
                    header.expires = parse_delta_seconds(v);
                    if header.expires.is_none() {
                        warn!("ignoring bad Subscription-State expires: {v}");
                    }
                }
                ("retry-after", Some(v)) => {
                    header.retry_after = parse_delta_seconds(v);
                    if header.retry_after.is_none() {
                        warn!("ignoring bad Subscription-State retry-after: {v}");
                    }
                }
                _ => header
                    .params
                    .push((key, value.map(|v| v.to_string()))),
            }
        }

        Ok(header)
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SubState::Terminated
    }
}

/// Parse a delta-seconds header value (`Expires`, `Min-Expires`).
/// Absent sign, non-numeric and out-of-range input yield `None`.
pub fn parse_delta_seconds(input: &str) -> Option<u32> {
    let value = input.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value
        .parse::<u64>()
        .ok()
        .filter(|v| *v <= MAX_DELTA_SECONDS)
        .map(|v| v as u32)
}

/// Validate a `SIP-ETag` value; entity tags are tokens.
pub fn parse_entity_tag(input: &str) -> Option<String> {
    let value = input.trim();
    if value.is_empty() || value.len() > MAX_ENTITY_TAG_LEN {
        return None;
    }
    let valid = value.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~')
    });
    valid.then(|| value.to_string())
}

/// Extract the `tag` parameter from a From/To header value.
pub fn tag_param(input: &str) -> Option<&str> {
    // name-addr params follow the closing '>' when present
    let params = match input.rfind('>') {
        Some(pos) => &input[pos + 1..],
        None => input,
    };
    params.split(';').skip(1).find_map(|param| {
        let mut kv = param.trim().splitn(2, '=');
        let key = kv.next()?;
        if key.trim().eq_ignore_ascii_case("tag") {
            kv.next().map(str::trim).filter(|v| !v.is_empty())
        } else {
            None
        }
    })
}
