//! Predicates deciding whether an exchange is observed at all.
//!
//! A skipped exchange goes straight to the inner service: no body is captured, no record is
//! built and nothing is emitted.

use axum::{extract::Request, http::Uri};
use std::{fmt, sync::Arc};

/// Query parameter conventionally used to switch observation off per request.
pub const DEFAULT_SKIP_PARAM: &str = "logMode";

type Predicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// A set of predicates evaluated once per exchange, before any capture work.
///
/// The exchange is skipped when any predicate returns `true`. The default policy has no
/// predicates and never skips.
///
/// # Examples
///
/// ```rust
/// use peephole::{SkipPolicy, DEFAULT_SKIP_PARAM};
///
/// // `?logMode=false` turns observation off for a single request,
/// // and health checks are never observed.
/// let skip = SkipPolicy::query_flag(DEFAULT_SKIP_PARAM)
///     .with(|request| request.uri().path() == "/healthz");
/// ```
#[derive(Clone, Default)]
pub struct SkipPolicy {
    predicates: Vec<Predicate>,
}

impl SkipPolicy {
    /// A policy that observes every exchange.
    pub fn never() -> Self {
        Self::default()
    }

    /// Skips when the query parameter `name` parses as a boolean `false`.
    ///
    /// An absent or unparsable parameter does not skip. Accepted spellings are `1`, `t`, `T`,
    /// `TRUE`, `true`, `True` and `0`, `f`, `F`, `FALSE`, `false`, `False`.
    pub fn query_flag(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::never().with(move |request| {
            query_param(request.uri(), &name)
                .as_deref()
                .and_then(parse_bool)
                .is_some_and(|observe| !observe)
        })
    }

    /// Skips every request whose path starts with `prefix`.
    pub fn path_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::never().with(move |request| request.uri().path().starts_with(prefix.as_str()))
    }

    /// Add a predicate. Returns self for builder pattern.
    pub fn with<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn should_skip(&self, request: &Request) -> bool {
        self.predicates.iter().any(|predicate| predicate(request))
    }

    /// Returns true if no predicates have been added.
    pub fn is_never(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl fmt::Debug for SkipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipPolicy")
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// First value of the query parameter `name`, percent-decoded.
fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

/// Parses the boolean spellings commonly accepted on query strings.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
