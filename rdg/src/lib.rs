//! Render dependency graph: a single-use, lazily-materialised frame graph
//! built on top of the `rhi` Vulkan backend.
//!
//! A caller declares textures/buffers and passes against an [`RdgBuilder`],
//! then calls [`RdgBuilder::execute`]. The builder works out pass ordering,
//! resource lifetimes, and the minimal set of barriers, then materialises
//! and runs everything in one shot.

mod builder;
mod error;
mod pass;
mod resource;

pub use builder::RdgBuilder;
pub use error::RdgError;
pub use pass::{RdgPassBuilder, Transition, TransitionTarget};
pub use resource::{RdgBufferDesc, RdgBufferHandle, RdgPassHandle, RdgTextureDesc, RdgTextureHandle};

pub use rhit::{RdgBufferFlags, RdgPassFlags, RdgTextureFlags, RhiAccess};
