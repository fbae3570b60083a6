//! Attack pattern detection.

mod detector;
mod observation;
mod stats;

pub use detector::AttackPatternDetector;
pub use observation::{normalize_identifier, AttackPattern, AttackType, Observation, ANONYMOUS};
