//! Adaptive compilation: deciding when and at which tier a method is
//! (re)compiled, and publishing the result.
//!
//! A method moves through `uncompiled -> compiling(tier) -> compiled(tier)
//! -> compiling(higher tier) -> ...`. Requests for the same method and
//! directive join one compilation; a lower tier never replaces an installed
//! higher one.

use std::fmt;

use serde::{Deserialize, Serialize};

mod compilation;
mod compiler;
mod method;
mod scheduler;

pub use compilation::{Compilation, CompilationHandle};
pub use compiler::{Compiler, LirCompiler};
pub use method::{LirSource, Method, MethodFlags};
pub use scheduler::{
    AdaptiveScheduler, CalleeResolver, CompilationObserver, EvictionHook, SchedulerBuilder, SchedulerStats,
    StatsSnapshot,
};

/// Compilation quality level. Ordered: a higher tier supersedes a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fast, simple code: runtime division, no peephole, no native calls.
    Baseline,
    Optimized,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Baseline => f.write_str("baseline"),
            Tier::Optimized => f.write_str("optimized"),
        }
    }
}

/// What the requester asks for. Results are cached per directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilationDirective {
    /// Let the tier policy decide.
    Default,
    Baseline,
    Optimize,
}

impl CompilationDirective {
    pub fn forced_tier(self) -> Option<Tier> {
        match self {
            CompilationDirective::Default => None,
            CompilationDirective::Baseline => Some(Tier::Baseline),
            CompilationDirective::Optimize => Some(Tier::Optimized),
        }
    }
}

impl fmt::Display for CompilationDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationDirective::Default => f.write_str("default"),
            CompilationDirective::Baseline => f.write_str("baseline"),
            CompilationDirective::Optimize => f.write_str("optimize"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order() {
        assert!(Tier::Optimized > Tier::Baseline);
        assert_eq!(Tier::Optimized.to_string(), "optimized");
        assert_eq!(serde_json::to_string(&Tier::Baseline).unwrap(), "\"baseline\"");
    }

    #[test]
    fn test_forced_tier() {
        assert_eq!(CompilationDirective::Default.forced_tier(), None);
        assert_eq!(CompilationDirective::Optimize.forced_tier(), Some(Tier::Optimized));
    }
}
