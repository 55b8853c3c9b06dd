//! Utilities shared by the session and its plugins.

mod named_progress;
mod rng;

pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;
