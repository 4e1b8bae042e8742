//! Wire messages exchanged between contexts.

pub mod iframe;
pub mod runtime;
