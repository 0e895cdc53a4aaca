//! HTTP headers handling
//!
//! This module provides a type for managing HTTP headers with case-insensitive
//! lookups. Request headers follow last-value-wins semantics except for
//! list-valued fields, whose repeated occurrences are combined into one value.
//! Response headers may repeat (`Set-Cookie`) and are appended in order.

use super::{Error, Result};
use std::fmt;

/// Request header names whose repeated values are joined rather than replaced
const LIST_VALUED: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "connection",
    "forwarded",
    "pragma",
    "te",
    "transfer-encoding",
    "via",
    "x-forwarded-for",
];

/// HTTP headers collection
///
/// Headers are stored in insertion order and support:
/// - Case-insensitive header name lookups
/// - Replacement, appending, or semantic combination of repeated names
/// - Iteration over all headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Insert a header, replacing every existing value with the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        if let Some(pos) = self.position(&name) {
            self.headers[pos].1 = value;
            let mut idx = pos + 1;
            while idx < self.headers.len() {
                if self.headers[idx].0.eq_ignore_ascii_case(&name) {
                    self.headers.remove(idx);
                } else {
                    idx += 1;
                }
            }
        } else {
            self.headers.push((name, value));
        }
    }

    /// Append a header without touching existing values
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Add a request header using request-side duplicate semantics
    ///
    /// List-valued fields are joined with `, ` (`Cookie` with `; `);
    /// everything else is last-value-wins.
    pub fn combine(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        let separator = if name.eq_ignore_ascii_case("cookie") {
            Some("; ")
        } else if LIST_VALUED.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
            Some(", ")
        } else {
            None
        };

        match (separator, self.position(&name)) {
            (Some(sep), Some(pos)) => {
                let existing = &mut self.headers[pos].1;
                existing.push_str(sep);
                existing.push_str(&value);
            }
            _ => self.insert(name, value),
        }
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Check whether a comma-separated header contains `token` (case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Remove all instances of a header (case-insensitive)
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.headers.len()
    }

    /// Parse the `Content-Length` header
    ///
    /// Repeated identical values are tolerated; differing values or
    /// non-digit characters are rejected.
    pub fn content_length(&self) -> Result<Option<u64>> {
        let mut length = None;
        for value in self.get_all("Content-Length") {
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::InvalidHeader(format!(
                        "Invalid Content-Length: {}",
                        value
                    )));
                }
                let parsed = part.parse::<u64>().map_err(|_| {
                    Error::InvalidHeader(format!("Invalid Content-Length: {}", value))
                })?;
                match length {
                    Some(prev) if prev != parsed => {
                        return Err(Error::InvalidHeader(
                            "Conflicting Content-Length values".to_string(),
                        ));
                    }
                    _ => length = Some(parsed),
                }
            }
        }
        Ok(length)
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse a header line into name and value
    ///
    /// The line must be ASCII, contain a colon, carry a non-empty token as
    /// its name and no embedded CR or LF.
    pub fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
        if !line.is_ascii() {
            return Err(Error::InvalidHeader("Non-ASCII header line".to_string()));
        }
        if line.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0) {
            return Err(Error::InvalidHeader(
                "Embedded line break in header".to_string(),
            ));
        }
        if matches!(line.first(), Some(b' ') | Some(b'\t')) {
            return Err(Error::InvalidHeader(
                "Obsolete line folding is not supported".to_string(),
            ));
        }

        let colon_pos = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| {
                Error::InvalidHeader(format!(
                    "No colon in header: {}",
                    String::from_utf8_lossy(line)
                ))
            })?;

        let name = &line[..colon_pos];
        if name.is_empty() {
            return Err(Error::InvalidHeader("Empty header name".to_string()));
        }
        if !name.iter().all(|&b| is_token_char(b)) {
            return Err(Error::InvalidHeader(format!(
                "Invalid header name: {}",
                String::from_utf8_lossy(name)
            )));
        }

        // Both slices are ASCII, so the conversions cannot fail.
        let name = String::from_utf8_lossy(name).into_owned();
        let value = String::from_utf8_lossy(&line[colon_pos + 1..])
            .trim_matches(|c| c == ' ' || c == '\t')
            .to_string();

        Ok((name, value))
    }

    /// Check that a header is safe to write onto the wire
    pub fn validate_field(name: &str, value: &str) -> Result<()> {
        if name.is_empty() || !name.bytes().all(is_token_char) {
            return Err(Error::InvalidHeader(format!("Invalid header name: {:?}", name)));
        }
        if !value.is_ascii() || value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
            return Err(Error::InvalidHeader(format!(
                "Invalid value for header {}",
                name
            )));
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// RFC 9110 `tchar`
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.into_iter()
    }
}
