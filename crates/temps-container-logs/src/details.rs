//! Log details ("attributes") token codec
//!
//! Details are rendered as `k1=v1,k2=v2` with every key and value query
//! escaped independently and pairs sorted by raw key, so the same attribute
//! set always produces the same token.

use thiserror::Error;

use crate::message::LogAttributes;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetailsError {
    #[error("invalid details format")]
    Malformed,

    #[error("invalid URL escape {0:?}")]
    InvalidEscape(String),

    #[error("invalid UTF-8 in details")]
    InvalidUtf8,
}

/// Encodes an attribute set into a details token.
pub fn encode_details(attrs: &LogAttributes) -> String {
    let mut pairs: Vec<(&String, &String)> = attrs.iter().collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", query_escape(key), query_escape(value)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a details token back into an attribute set.
///
/// Every comma separated segment must split on its first `=` into a key and
/// a value. Pair order is irrelevant and a repeated key keeps its last value.
pub fn parse_details(details: &str) -> Result<LogAttributes, DetailsError> {
    let mut attrs = LogAttributes::new();
    for pair in details.split(',') {
        let (key, value) = pair.split_once('=').ok_or(DetailsError::Malformed)?;
        attrs.insert(query_unescape(key)?, query_unescape(value)?);
    }
    Ok(attrs)
}

/// Query-style escaping: a space becomes `+` and a literal `+` is `%2B`.
fn query_escape(s: &str) -> String {
    urlencoding::encode(s).replace("%20", "+")
}

fn query_unescape(s: &str) -> Result<String, DetailsError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(bytes.len());
                return Err(DetailsError::InvalidEscape(
                    String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    // `+` is a space in query encoding; an escaped plus (%2B) survives this.
    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| DetailsError::InvalidUtf8)
}
