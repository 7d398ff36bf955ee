//! Types library for the order analytics pipeline
//!
//! Core type definitions shared between order event producers and the
//! analytics service, kept small and stable so both sides agree on the
//! wire representation.
//!
//! # Modules
//! - `ids`: Identifiers (EventId, OrderId, UserId)
//! - `numeric`: Exact decimal money (Amount)

// Public modules
pub mod ids;
pub mod numeric;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
}
