//! Continuation tokens for the polling change feed.
//!
//! A token is the base64-URL encoding of the textual form of the maximum
//! sentinel observed at the start of a read. Clients treat tokens as opaque;
//! the layer accepts only valid base64-URL and rejects anything else before
//! it can reach a query.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::LayerError;

/// Sentinel time format: `YYYY-MM-DD HH:MM:SS.ffffff`.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Declared datatype of a dataset's since column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinceDatatype {
    Int,
    Float,
    String,
    Time,
}

/// Formats a sentinel timestamp in its canonical textual form.
pub fn format_time(t: NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Encodes the textual sentinel form as an opaque token.
pub fn encode(raw: &str) -> String {
    URL_SAFE.encode(raw.as_bytes())
}

/// Decodes a client-supplied token back to the textual sentinel form.
pub fn decode(token: &str) -> Result<String, LayerError> {
    let bytes = URL_SAFE
        .decode(token.as_bytes())
        .map_err(|e| LayerError::BadParameter(format!("invalid since token: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| LayerError::BadParameter(format!("invalid since token: {e}")))
}

/// Renders a decoded sentinel as a SQL literal for the window predicate.
///
/// Numbers must parse as the declared datatype and are interpolated
/// unquoted in canonical form; strings and times are single-quoted with
/// embedded quotes doubled. Decoded tokens are the only client-originated
/// text that reaches the query, so this is where they are contained.
pub fn quote(raw: &str, datatype: SinceDatatype) -> Result<String, LayerError> {
    match datatype {
        SinceDatatype::Int => {
            let v: i64 = raw
                .parse()
                .map_err(|_| LayerError::BadParameter(format!("invalid int sentinel: {raw}")))?;
            Ok(v.to_string())
        }
        SinceDatatype::Float => {
            let v: f64 = raw
                .parse()
                .map_err(|_| LayerError::BadParameter(format!("invalid float sentinel: {raw}")))?;
            Ok(v.to_string())
        }
        SinceDatatype::String | SinceDatatype::Time => Ok(quote_text(raw)),
    }
}

/// Single-quotes a text literal, doubling embedded quotes.
pub fn quote_text(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        for raw in ["3", "2024-01-02 10:30:00.000000", "", "abc/def?x=1"] {
            let token = encode(raw);
            assert_eq!(decode(&token).unwrap(), raw);
            // re-encoding the decoded form yields the original token
            assert_eq!(encode(&decode(&token).unwrap()), token);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode("not base64!!"),
            Err(LayerError::BadParameter(_))
        ));
    }

    #[test]
    fn time_format_is_microsecond_padded() {
        let t = NaiveDateTime::parse_from_str("2024-03-05 07:08:09", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(format_time(t), "2024-03-05 07:08:09.000000");
    }

    #[test]
    fn numeric_sentinels_are_validated() {
        assert_eq!(quote("42", SinceDatatype::Int).unwrap(), "42");
        assert_eq!(quote("1.5", SinceDatatype::Float).unwrap(), "1.5");
        assert!(quote("42; DROP TABLE x", SinceDatatype::Int).is_err());
        assert!(quote("abc", SinceDatatype::Float).is_err());
    }

    #[test]
    fn text_sentinels_are_escaped() {
        assert_eq!(quote("abc", SinceDatatype::String).unwrap(), "'abc'");
        assert_eq!(
            quote("o'brien", SinceDatatype::String).unwrap(),
            "'o''brien'"
        );
        assert_eq!(
            quote("2024-01-02 10:30:00.000000", SinceDatatype::Time).unwrap(),
            "'2024-01-02 10:30:00.000000'"
        );
    }
}
