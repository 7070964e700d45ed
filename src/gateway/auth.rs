//! Handshake credential check.
//!
//! Clients present the shared secret in the upgrade request's query string,
//! as `password` or (older clients) `guid`. The comparison is a plain trimmed
//! equality and is not constant-time.

/// Pull the presented secret out of a raw (still percent-encoded) query string.
///
/// `password` wins over `guid` regardless of order. The value is percent-decoded;
/// an undecodable value is returned as-is.
pub fn handshake_secret(raw_query: Option<&str>) -> Option<String> {
    let query = raw_query?;
    let mut password = None;
    let mut guid = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "password" if password.is_none() => password = Some(value),
            "guid" if guid.is_none() => guid = Some(value),
            _ => {}
        }
    }
    let raw = password.or(guid)?;
    Some(match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    })
}

/// Trimmed equality of the presented secret against the configured one.
/// A missing secret never matches.
pub fn authenticate(presented: Option<&str>, configured: &str) -> bool {
    match presented {
        Some(presented) => presented.trim() == configured.trim(),
        None => false,
    }
}
