//! xtun Router - Domain/IP Routing Policy
//!
//! Six category lists decide where traffic goes:
//!
//! ```text
//!            domain          ip
//!  block   ┌──────────┬──────────┐   checked first
//!  direct  ├──────────┼──────────┤
//!  proxy   ├──────────┼──────────┤   checked last
//!          └──────────┴──────────┘
//!  no match → proxy (global mode) / direct
//! ```
//!
//! Each list is replaced wholesale; readers never observe a partially
//! replaced list.

mod engine;
mod policy;
mod rule;

pub use engine::{RoutingEngine, RuleTable};
pub use policy::StatsPolicy;
pub use rule::{Category, MatchType, RouteAction, RoutingRule, RuleError};
