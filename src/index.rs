//! Index specification model: canonical normalization, equivalence and
//! temp-name derivation.

mod spec;

pub use spec::*;
