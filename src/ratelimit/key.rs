//! Counter key generation for limiter state.

use crate::config::Algorithm;

/// A key that uniquely identifies one identifier's counter for one algorithm.
///
/// Fixed windows also carry the window index so each window gets a fresh
/// counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The client identifier
    pub identifier: String,
    /// The algorithm owning this state
    pub algorithm: Algorithm,
    /// `floor(now / window)` for fixed windows
    pub window: Option<i64>,
}

impl LimiterKey {
    /// Key for a fixed window counter.
    pub fn fixed(identifier: &str, window: i64) -> Self {
        Self {
            identifier: identifier.to_string(),
            algorithm: Algorithm::FixedWindow,
            window: Some(window),
        }
    }

    /// Key for a sliding window log.
    pub fn sliding(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            algorithm: Algorithm::SlidingWindow,
            window: None,
        }
    }

    /// Convert the key to the string used by counter stores.
    pub fn to_string_key(&self) -> String {
        match self.window {
            Some(window) => format!("{}:{}:{}", self.algorithm, self.identifier, window),
            None => format!("{}:{}", self.algorithm, self.identifier),
        }
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
