//! Exchange-scoped key/value store.
//!
//! The middleware installs a [`ContextValues`] into the request extensions before dispatching,
//! so middleware and handlers further down the chain can attach values (an auth token, a tenant
//! id, ...) that end up in the observation record.

use axum::extract::Request;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

/// String recorded for a configured context key that was never set.
pub const MISSING_VALUE: &str = "<nil>";

/// Shared handle to the values set during one exchange.
///
/// Cloning is cheap; all clones see the same values.
///
/// # Examples
///
/// ```rust
/// use axum::{extract::Request, middleware::Next, response::Response};
/// use peephole::ContextValues;
///
/// async fn set_token(request: Request, next: Next) -> Response {
///     if let Some(values) = request.extensions().get::<ContextValues>() {
///         values.insert("token", "abc123");
///     }
///     next.run(request).await
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextValues {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl ContextValues {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, stringifying `value` with its `Display` implementation.
    pub fn insert(&self, key: impl Into<String>, value: impl fmt::Display) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.to_string());
    }

    /// The value for `key`, if it was set.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// The value for `key`, or [`MISSING_VALUE`] if it was never set.
    pub fn get_or_missing(&self, key: &str) -> String {
        self.get(key).unwrap_or_else(|| MISSING_VALUE.to_owned())
    }

    /// Number of values set so far.
    pub fn len(&self) -> usize {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no value has been set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the store attached to `request`, attaching a new one if an outer layer has not
    /// already done so.
    pub(crate) fn install(request: &mut Request) -> Self {
        if let Some(existing) = request.extensions().get::<ContextValues>() {
            return existing.clone();
        }
        let values = ContextValues::new();
        request.extensions_mut().insert(values.clone());
        values
    }
}
