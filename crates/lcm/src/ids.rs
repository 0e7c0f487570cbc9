//! Stable identifier scheme surfaced to the agent.
//!
//! Plain integers name messages, `S`-prefixed ids name summaries, and
//! `F`-prefixed ids name file references. These are stable for the life of
//! a session and are what the retrieval verbs accept.

use std::fmt;

use crate::errors::LcmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcmId {
    Message(i64),
    Summary(i64),
    File(i64),
}

impl LcmId {
    pub fn parse(raw: &str) -> Result<Self, LcmError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LcmError::InputError("empty id".into()));
        }

        let (variant, digits): (fn(i64) -> LcmId, &str) = if let Some(rest) = raw.strip_prefix('S')
        {
            (LcmId::Summary, rest)
        } else if let Some(rest) = raw.strip_prefix('F') {
            (LcmId::File, rest)
        } else {
            (LcmId::Message, raw)
        };

        digits
            .parse::<i64>()
            .ok()
            .filter(|n| *n > 0)
            .map(variant)
            .ok_or_else(|| LcmError::InputError(format!("malformed id: {raw:?}")))
    }
}

impl fmt::Display for LcmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LcmId::Message(n) => write!(f, "{n}"),
            LcmId::Summary(n) => write!(f, "S{n}"),
            LcmId::File(n) => write!(f, "F{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_forms() {
        assert_eq!(LcmId::parse("42").unwrap(), LcmId::Message(42));
        assert_eq!(LcmId::parse("S7").unwrap(), LcmId::Summary(7));
        assert_eq!(LcmId::parse("F3").unwrap(), LcmId::File(3));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(LcmId::parse(" S12 ").unwrap(), LcmId::Summary(12));
    }

    #[test]
    fn rejects_garbage() {
        assert!(LcmId::parse("").is_err());
        assert!(LcmId::parse("X9").is_err());
        assert!(LcmId::parse("S").is_err());
        assert!(LcmId::parse("S-1").is_err());
        assert!(LcmId::parse("0").is_err());
        assert!(LcmId::parse("12abc").is_err());
    }

    #[test]
    fn display_round_trips() {
        for raw in ["17", "S4", "F9"] {
            let id = LcmId::parse(raw).unwrap();
            assert_eq!(id.to_string(), raw);
            assert_eq!(LcmId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
