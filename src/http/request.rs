//! Inbound HTTP request as handed over by the host adapter.

use std::collections::HashMap;

use bytes::Bytes;

use super::{Headers, Method};

/// An inbound HTTP request.
///
/// Constructed by the host adapter from whatever its transport produced.
/// An absolute target URL also records the request origin
/// (`scheme://authority`); a relative target leaves it unset.
///
/// Cloning is cheap: the body is a shared [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use reqscope::http::{Method, Request};
///
/// let request = Request::new(Method::Get, "https://test.local/hello?name=world#top")
///     .with_header("Accept", "text/html");
///
/// assert_eq!(request.origin(), Some("https://test.local"));
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name").as_deref(), Some("world"));
/// assert_eq!(request.path_and_query(), "/hello?name=world");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    origin: Option<String>,
    path: String,
    query: Option<String>,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Creates a request for `target`, which may be absolute (`https://host/path?q`)
    /// or origin-relative (`/path?q`).
    pub fn new(method: Method, target: &str) -> Self {
        let (origin, rest) = split_origin(target);

        let rest = rest.split('#').next().unwrap_or_default();
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (rest, None),
        };
        let path = if path.is_empty() {
            "/".to_owned()
        } else {
            path.to_owned()
        };

        Self {
            method,
            origin,
            path,
            query,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(target: &str) -> Self {
        Self::new(Method::Get, target)
    }

    /// Appends a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns `scheme://authority` when the request was built from an absolute URL.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the path followed by `?query` when a query is present.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Returns a query parameter value by key (`+` decoded as a space).
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.query
            .as_deref()
            .map(parse_query_string)
            .and_then(|mut params| params.remove(key))
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

fn split_origin(target: &str) -> (Option<String>, &str) {
    if target.starts_with('/') {
        return (None, target);
    }
    let Some(scheme_end) = target.find("://") else {
        return (None, target);
    };
    let authority_start = scheme_end + 3;
    let authority_end = target[authority_start..]
        .find(['/', '?', '#'])
        .map_or(target.len(), |offset| authority_start + offset);

    (
        Some(target[..authority_end].to_ascii_lowercase()),
        &target[authority_end..],
    )
}

fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}
