//! IEEE 2030.5 (SEP2) resource handling: leaf extraction from the XML the
//! meter serves and resolution of the meter's own identity.

pub mod extract;
pub mod identity;

/// Namespace of every 2030.5 element the meter serves.
pub const IEEE_NS: &str = "urn:ieee:std:2030.5:ns";

pub use extract::{extract, ExtractError, ReadingResult};
pub use identity::{resolve, IdentityError, MeterIdentity};
