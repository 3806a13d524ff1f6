//! Join-party variant selection.
//!
//! Requests carry the protocol version of the requester; anything older than
//! [`NEW_JOIN_PARTY_VERSION`] is served the leaderless variant, everything
//! else the leader-based one.

use thiserror::Error;

/// First version that speaks the leader-based join-party protocol.
pub const NEW_JOIN_PARTY_VERSION: &str = "0.14.0";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed version string: {0}")]
pub struct VersionError(String);

fn parse_parts(version: &str) -> Result<Vec<u64>, VersionError> {
    let parts = version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|p| p.parse::<u64>().map_err(|_| VersionError(version.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    if parts.is_empty() {
        return Err(VersionError(version.to_string()));
    }
    Ok(parts)
}

/// Pure predicate: is `version` strictly older than `reference`?
///
/// Missing components compare as zero, so "0.14" equals "0.14.0".
pub fn is_older_than(version: &str, reference: &str) -> Result<bool, VersionError> {
    let a = parse_parts(version)?;
    let b = parse_parts(reference)?;
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return Ok(x < y);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(is_older_than("0.13.9", NEW_JOIN_PARTY_VERSION).unwrap());
        assert!(!is_older_than("0.14.0", NEW_JOIN_PARTY_VERSION).unwrap());
        assert!(!is_older_than("0.15.1", NEW_JOIN_PARTY_VERSION).unwrap());
        assert!(!is_older_than("1.0.0", NEW_JOIN_PARTY_VERSION).unwrap());
    }

    #[test]
    fn test_short_and_prefixed_forms() {
        assert!(!is_older_than("0.14", "0.14.0").unwrap());
        assert!(is_older_than("v0.2", "0.14.0").unwrap());
    }

    #[test]
    fn test_malformed_is_an_error() {
        assert!(is_older_than("not-a-version", "0.14.0").is_err());
        assert!(is_older_than("", "0.14.0").is_err());
    }
}
