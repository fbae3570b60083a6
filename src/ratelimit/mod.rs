//! Rate limiting logic and state management.

mod algorithm;
mod backend;
mod fallback;
mod fixed_window;
mod key;
mod leaky_bucket;
mod local;
mod service;
mod sliding_window;
mod token_bucket;

pub use algorithm::{build, Admission, Decision};
pub use backend::{CounterStore, WindowAdmission};
pub use fallback::FallbackStore;
pub use fixed_window::FixedWindow;
pub use key::LimiterKey;
pub use leaky_bucket::LeakyBucket;
pub use local::LocalStore;
pub use service::{CleanupHandle, CleanupStats, RateLimitResult, RateLimitService};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;
