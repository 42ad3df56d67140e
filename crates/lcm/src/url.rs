// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider connection strings.
//!
//! ```text
//! scheme://network-location?key=value&key=value
//! ```
//!
//! The scheme is stored under `protocol` and a non-empty location under
//! `network`, so providers read everything through the same typed getters.
//! Values are taken verbatim: no percent-decoding is performed.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Parsed `scheme://location?query` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcmUrl {
    raw: String,
    scheme: String,
    location: String,
    params: HashMap<String, String>,
}

impl LcmUrl {
    /// Parse a connection string.
    ///
    /// Fails only when `://` is missing or the scheme is empty. Malformed
    /// query pairs are logged and skipped.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        if scheme.is_empty() {
            return Err(Error::InvalidUrl(url.to_string()));
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let mut params = HashMap::new();
        params.insert("protocol".to_string(), scheme.to_string());
        if !location.is_empty() {
            params.insert("network".to_string(), location.to_string());
        }

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let mut parts = pair.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) if !key.is_empty() => {
                    params.insert(key.to_string(), value.to_string());
                }
                _ => tracing::warn!("ignoring malformed URL parameter '{}' in {}", pair, url),
            }
        }

        Ok(Self {
            raw: url.to_string(),
            scheme: scheme.to_string(),
            location: location.to_string(),
            params,
        })
    }

    /// Provider scheme (`udpm`, `tcpq`, `file`, `memq`).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Text between `://` and `?`, possibly empty.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Original connection string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Raw parameter value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        self.get_parsed(key, default)
    }

    pub fn get_double(&self, key: &str, default: f64) -> Result<f64> {
        self.get_parsed(key, default)
    }

    /// Boolean parameter: `true`/`false` in any case, or `1`/`0`.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
            Some(v) => Err(invalid_param(key, v)),
        }
    }

    fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.trim().parse().map_err(|_| invalid_param(key, v)),
        }
    }
}

impl FromStr for LcmUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LcmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn invalid_param(key: &str, value: &str) -> Error {
    Error::InvalidParam {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheme_location_and_query() {
        let url = LcmUrl::parse("udpm://239.255.76.67:7667?ttl=1&recv_buf_size=2097152")
            .expect("valid url");
        assert_eq!(url.scheme(), "udpm");
        assert_eq!(url.location(), "239.255.76.67:7667");
        assert_eq!(url.get("protocol"), Some("udpm"));
        assert_eq!(url.get("network"), Some("239.255.76.67:7667"));
        assert_eq!(url.get_int("ttl", 0).expect("int"), 1);
        assert_eq!(url.get_int("recv_buf_size", 0).expect("int"), 2_097_152);
    }

    #[test]
    fn test_missing_separator_is_fatal() {
        assert!(matches!(LcmUrl::parse("udpm"), Err(Error::InvalidUrl(_))));
        assert!(matches!(LcmUrl::parse("udpm:/x"), Err(Error::InvalidUrl(_))));
        assert!(matches!(LcmUrl::parse("://x"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_empty_location_has_no_network_key() {
        let url = LcmUrl::parse("udpm://").expect("valid url");
        assert_eq!(url.location(), "");
        assert!(!url.contains("network"));
        assert_eq!(url.get_str("network", "fallback"), "fallback");
    }

    #[test]
    fn test_malformed_pairs_are_skipped() {
        let url = LcmUrl::parse("file:///tmp/a.log?speed&a=b=c&delay=2&&verbose=1")
            .expect("valid url");
        assert!(!url.contains("speed"));
        assert!(!url.contains("a"));
        assert_eq!(url.get_double("delay", 0.5).expect("double"), 2.0);
        assert!(url.get_bool("verbose", false).expect("bool"));
    }

    #[test]
    fn test_defaults_when_absent() {
        let url = LcmUrl::parse("tcpq://host:1").expect("valid url");
        assert_eq!(url.get_int("ttl", 7).expect("int"), 7);
        assert_eq!(url.get_double("speed", 1.5).expect("double"), 1.5);
        assert!(!url.get_bool("verbose", false).expect("bool"));
        assert_eq!(url.get_str("mode", "r"), "r");
    }

    #[test]
    fn test_bool_forms() {
        let url = LcmUrl::parse("file://x?a=TRUE&b=False&c=1&d=0&e=yes").expect("valid url");
        assert!(url.get_bool("a", false).expect("bool"));
        assert!(!url.get_bool("b", true).expect("bool"));
        assert!(url.get_bool("c", false).expect("bool"));
        assert!(!url.get_bool("d", true).expect("bool"));
        assert!(matches!(
            url.get_bool("e", false),
            Err(Error::InvalidParam { .. })
        ));
    }

    #[test]
    fn test_bad_number_is_invalid_param() {
        let url = LcmUrl::parse("udpm://g:1?ttl=abc").expect("valid url");
        let err = url.get_int("ttl", 0).expect_err("not a number");
        assert!(matches!(err, Error::InvalidParam { ref key, .. } if key == "ttl"));
    }

    #[test]
    fn test_no_percent_decoding() {
        let url = LcmUrl::parse("file:///tmp/my%20log?x=a%26b").expect("valid url");
        assert_eq!(url.location(), "/tmp/my%20log");
        assert_eq!(url.get("x"), Some("a%26b"));
    }

    #[test]
    fn test_only_first_question_mark_splits() {
        let url = LcmUrl::parse("file://a?b=c?d").expect("valid url");
        assert_eq!(url.location(), "a");
        assert_eq!(url.get("b"), Some("c?d"));
    }
}
