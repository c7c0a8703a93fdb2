//! SPF record cache and evaluation
//!
//! RFC 7208 evaluation with the local repairs this engine has always
//! carried: CIDR-typo rewriting, a best-guess record for silent domains,
//! and SOFTFAIL instead of PERMERROR on syntax-error fallthrough.
//! The obsolete SPF RR type (99) is never queried (RFC 7208 §3.1).

pub mod eval;
pub mod record;
pub mod registry;

pub use eval::{SpfEvaluator, SpfOutcome};
pub use record::{Directive, Mechanism, Qualifier, RecordOrigin, SpfRecord};
pub use registry::SpfRegistry;
