//! Response header mutations queued during a request.

use std::fmt;

use crate::http::Headers;

use super::{ScopeError, with_context};

/// One or more values for a header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        Self::One(value.to_owned())
    }
}

impl From<String> for HeaderValues {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

impl From<Vec<String>> for HeaderValues {
    fn from(values: Vec<String>) -> Self {
        Self::Many(values)
    }
}

impl From<Vec<&str>> for HeaderValues {
    fn from(values: Vec<&str>) -> Self {
        Self::Many(values.into_iter().map(str::to_owned).collect())
    }
}

impl<const N: usize> From<[&str; N]> for HeaderValues {
    fn from(values: [&str; N]) -> Self {
        Self::Many(values.into_iter().map(str::to_owned).collect())
    }
}

/// A header name → value(s) record.
///
/// # Examples
///
/// ```
/// use reqscope::scope::HeaderRecord;
///
/// let record = HeaderRecord::new()
///     .entry("X-Test", "true")
///     .entry("X-List", ["2"]);
/// assert_eq!(record.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderRecord {
    entries: Vec<(String, HeaderValues)>,
}

impl HeaderRecord {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entry(mut self, name: impl Into<String>, values: impl Into<HeaderValues>) -> Self {
        self.entries.push((name.into(), values.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type Mutator = Box<dyn FnOnce(&mut Headers) + Send>;

/// A queued change to the outgoing response headers.
///
/// Record and [`Headers`] forms always append. The mutator form receives the
/// live headers and chooses append or replace itself.
pub enum HeaderUpdate {
    Record(HeaderRecord),
    Headers(Headers),
    Mutate(Mutator),
}

impl HeaderUpdate {
    /// Wraps a closure that edits the response headers directly.
    pub fn mutate<F>(f: F) -> Self
    where
        F: FnOnce(&mut Headers) + Send + 'static,
    {
        Self::Mutate(Box::new(f))
    }

    pub(crate) fn apply(self, headers: &mut Headers) {
        match self {
            Self::Record(record) => {
                for (name, values) in record.entries {
                    match values {
                        HeaderValues::One(value) => headers.append(name, value),
                        HeaderValues::Many(values) => {
                            for value in values {
                                headers.append(name.clone(), value);
                            }
                        }
                    }
                }
            }
            Self::Headers(extra) => {
                for (name, value) in extra.iter() {
                    headers.append(name, value);
                }
            }
            Self::Mutate(mutate) => mutate(headers),
        }
    }
}

impl From<HeaderRecord> for HeaderUpdate {
    fn from(record: HeaderRecord) -> Self {
        Self::Record(record)
    }
}

impl From<Headers> for HeaderUpdate {
    fn from(headers: Headers) -> Self {
        Self::Headers(headers)
    }
}

impl fmt::Debug for HeaderUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(record) => f.debug_tuple("Record").field(record).finish(),
            Self::Headers(headers) => f.debug_tuple("Headers").field(headers).finish(),
            Self::Mutate(_) => f.write_str("Mutate(..)"),
        }
    }
}

/// Queues a header change for the response of the current request.
///
/// May be called any number of times. Updates are applied in call order
/// after the handler returns successfully, before the response is handed
/// back to the host.
///
/// # Errors
///
/// [`ScopeError::Invalid`] outside a scope; [`ScopeError::Unsupported`] from
/// background work that runs after the response was produced.
pub fn set_response_headers(update: impl Into<HeaderUpdate>) -> Result<(), ScopeError> {
    let update = update.into();
    with_context(|ctx| match ctx.header_updates.lock().as_mut() {
        Some(updates) => {
            updates.push(update);
            Ok(())
        }
        None => Err(ScopeError::Unsupported("set_response_headers")),
    })
}
