//! Errors surfaced by the render dependency graph builder.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RdgError {
    /// The pass dependency graph contains a cycle; Kahn's algorithm could
    /// not place every pass. Names the first pass still unplaced, in
    /// registration order.
    #[error("render graph has a cyclic dependency at pass '{0}'")]
    CyclicGraph(String),

    /// A pass declared an access whose flag combination is invalid per
    /// `RhiAccess::is_valid` (mixes an exclusive-read flag with a write
    /// flag, or vice versa).
    #[error("pass '{pass}' declared an invalid access state for resource '{resource}'")]
    InvalidAccess { pass: String, resource: String },

    /// A pass, or `execute()`, referenced a texture/buffer handle that was
    /// never returned by this builder's `create_*`/`register_external_*`.
    #[error("resource '{0}' was never registered with this render graph")]
    UnregisteredResource(String),
}
