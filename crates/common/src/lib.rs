//! Shared building blocks for the Cumulus backend: the runtime seam that
//! supplies wall time and identifiers, the id newtypes, env-overridable
//! knobs, and the counting byte stream used on every upload path.

pub mod knobs;
pub mod runtime;
pub mod stream;
pub mod types;
