//! Error types for model compilation, sampling, and diagnostics.
//!
//! Each layer has its own enum: [`BuildError`] for everything that can go
//! wrong while turning model text plus data into a graph, [`RunError`] for
//! failures during sampling, and [`DiagError`] for diagnostics-time failures.
//! Build errors are fatal and abort before any sampling starts; run errors
//! are scoped to the chain that produced them.

use thiserror::Error;

/// Errors raised while parsing a model description and compiling it into a
/// [`crate::graph::Graph`]. No partial graph is ever returned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildError {
    /// The model text did not match the grammar.
    #[error("parse error: {0}")]
    Parse(String),

    /// An identifier in a parameter or deterministic expression resolved to
    /// neither a declared node nor a data binding.
    #[error("unknown symbol '{name}'")]
    UnknownSymbol { name: String },

    /// The dependency graph contains a cycle through the named node.
    #[error("cyclic dependency involving node '{name}'")]
    CyclicDependency { name: String },

    /// A supplied data array's length disagrees with the range it is used
    /// over, or an index falls outside a declared range.
    #[error("dimension mismatch for '{name}': expected {expected}, got {actual}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// A declared distribution family has no registered kernel.
    #[error("unsupported distribution '{name}'")]
    UnsupportedDistribution { name: String },

    /// A node was declared twice, or an indexed site collides with a scalar
    /// declaration of the same name.
    #[error("duplicate declaration of node '{name}'")]
    DuplicateNode { name: String },

    /// A loop bound or index expression could not be reduced to a constant
    /// at build time.
    #[error("expression for '{context}' is not constant at build time")]
    NonConstantIndex { context: String },
}

/// Errors raised while a chain is sampling. An error aborts the chain that
/// raised it; other chains are unaffected and their traces remain usable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RunError {
    /// A supplied or evaluated parameter left its valid domain, e.g. a
    /// non-positive precision. Raised eagerly instead of letting NaNs
    /// propagate through the log-density.
    #[error("invalid parameter for node '{node}': {detail}")]
    InvalidParameter { node: String, detail: String },

    /// A proposal or conjugate draw produced an out-of-support or non-finite
    /// value that the kernel cannot recover from.
    #[error("sampling diverged at node '{node}' (chain {chain}, iteration {iteration})")]
    SamplingDiverged {
        node: String,
        chain: usize,
        iteration: usize,
    },

    /// The run configuration is inconsistent (zero chains or iterations,
    /// zero thinning interval, unknown monitor name, ...).
    #[error("invalid run configuration: {detail}")]
    InvalidConfig { detail: String },

    /// An explicit initial value was supplied for a node that does not exist
    /// or does not match the node's shape.
    #[error("bad initial value for node '{node}': {detail}")]
    BadInitialValue { node: String, detail: String },
}

/// Errors raised by the diagnostics engine. These are recoverable: the
/// caller may re-run with a different configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DiagError {
    /// Gelman-Rubin needs at least two chains to compare.
    #[error("insufficient chains for diagnostics: need at least 2, got {actual}")]
    InsufficientChains { actual: usize },

    /// A trace had no retained samples for the requested component.
    #[error("empty trace for component '{component}'")]
    EmptyTrace { component: String },

    /// The named component is not among the monitored components.
    #[error("unknown monitored component '{component}'")]
    UnknownComponent { component: String },
}
