//! HTTP header map with case-insensitive name lookup.
//!
//! Headers are order-preserving and case-insensitive per RFC 9110 §5. The
//! same map backs both parsed request headers and pending response headers,
//! so it supports additive inserts (`Set-Cookie` style) as well as
//! replace-semantics [`set`](Headers::set) for response mutation.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use trellis::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("X-Tag", "first");
/// headers.insert("X-Tag", "second");
/// assert_eq!(headers.get_all("x-tag").count(), 2);
///
/// headers.set("X-Tag", "only");
/// assert_eq!(headers.get("X-TAG"), Some("only"));
/// assert_eq!(headers.get_all("x-tag").count(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every entry named `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries with the given name; returns `true` if any existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drops all entries, keeping the allocation.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn insert_is_additive() {
        let mut h = Headers::new();
        h.insert("Set-Cookie", "a=1");
        h.insert("Set-Cookie", "b=2");
        let vals: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(vals, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_all_occurrences() {
        let mut h = Headers::new();
        h.insert("X-Request-ID", "old-1");
        h.insert("x-request-id", "old-2");
        h.set("X-Request-ID", "new");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("x-request-id"), Some("new"));
    }

    #[test]
    fn remove_reports_presence() {
        let mut h = Headers::new();
        h.insert("X-Foo", "bar");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }

    #[test]
    fn clear_keeps_nothing() {
        let mut h = Headers::new();
        h.insert("A", "1");
        h.clear();
        assert!(!h.contains("a"));
        assert!(h.is_empty());
    }
}
