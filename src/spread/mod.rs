/// Spread module
///
/// Converts book-store state into a continuously fresh matrix of
/// cross-venue spreads:
///
/// - engine: dirty-key consumer, pair computation, throttled emission
/// - score:  composite ranking function and ordering rules
///
/// The engine owns no books; it reads consistent value snapshots from
/// the BookStore and publishes derived rows. Spread state outside the
/// engine's own caches does not exist.
pub mod engine;
pub mod score;

pub use engine::{EngineConfig, EngineHandle, SpreadEngine};
