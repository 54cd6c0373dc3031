//! HTTP request view handed to route handlers
//!
//! An [`HttpRequest`] borrows the parsed head and the router's captures and
//! only lives for one handler call. Copy out anything needed later.

use crate::parser::{RequestHead, Version};
use std::cell::OnceCell;

/// Request seen by a route handler
pub struct HttpRequest<'a> {
    head: &'a RequestHead,
    params: &'a [(String, String)],
    method: String,
    query: OnceCell<Vec<(String, String)>>,
    yielded: bool,
}

impl<'a> HttpRequest<'a> {
    pub(crate) fn new(head: &'a RequestHead, params: &'a [(String, String)]) -> Self {
        Self {
            head,
            params,
            method: head.method.to_ascii_lowercase(),
            query: OnceCell::new(),
            yielded: false,
        }
    }

    /// Lowercased method, e.g. `"get"`
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Method exactly as sent
    pub fn case_sensitive_method(&self) -> &str {
        &self.head.method
    }

    /// Path without the query string
    pub fn url(&self) -> &str {
        self.head.path()
    }

    /// Path including the query string
    pub fn full_url(&self) -> &str {
        &self.head.target
    }

    /// Raw query string without the leading `?`, empty if there is none
    pub fn query(&self) -> &str {
        self.head.query().unwrap_or("")
    }

    /// Decoded value of a query parameter
    ///
    /// The query string is parsed on first use. A key without `=` maps to
    /// the empty string.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .get_or_init(|| parse_query(self.query()))
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Header value by lowercase name, empty if absent
    pub fn header(&self, lower_key: &str) -> &str {
        self.head.header(lower_key).unwrap_or("")
    }

    /// All headers as (lowercase name, value), in arrival order
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.head.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Path parameter by position
    pub fn parameter(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|(_, v)| v.as_str())
    }

    /// Path parameter by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All path parameters as (name, value), in pattern order
    pub fn parameters(&self) -> &[(String, String)] {
        self.params
    }

    /// Decline this request; the next matching route is tried
    pub fn set_yield(&mut self, yielded: bool) {
        self.yielded = yielded;
    }

    pub fn get_yield(&self) -> bool {
        self.yielded
    }

    /// HTTP/1.0 request
    pub fn is_ancient(&self) -> bool {
        self.head.version == Version::Http10
    }

    pub(crate) fn head(&self) -> &RequestHead {
        self.head
    }
}

impl std::fmt::Debug for HttpRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.head.method)
            .field("url", &self.head.target)
            .field("params", &self.params)
            .finish()
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (urlencoding_decode(key), urlencoding_decode(value)),
            None => (urlencoding_decode(pair), String::new()),
        })
        .collect()
}

/// Percent-decoding with `+` as space; invalid escapes are kept verbatim
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| std::str::from_utf8(h).ok());
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        result.push(byte);
                        i += 3;
                        continue;
                    }
                    None => result.push(b'%'),
                }
            }
            b'+' => result.push(b' '),
            byte => result.push(byte),
        }
        i += 1;
    }

    String::from_utf8_lossy(&result).into_owned()
}
