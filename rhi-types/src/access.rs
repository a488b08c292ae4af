//! Resource access states and pass flags for automatic barrier insertion.
//!
//! Modelled as a `bitflags` type over the union of resource states a render
//! dependency graph needs to reason about; the read/write exclusivity rules
//! below follow the classic read-only-exclusive / write-only-exclusive /
//! UAV-is-both split used by frame-graph implementations.

bitflags::bitflags! {
    /// The state a resource (or subresource) is in during GPU execution.
    ///
    /// Used by the RDG builder to decide whether a transition is required
    /// between two accesses, and by `rhi`'s recorder to pick the Vulkan
    /// pipeline-stage/access masks and image layout for a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RhiAccess: u32 {
        /// Unknown / uninitialised state. Always requires a transition out of.
        const UNKNOWN               = 0;

        const CPU_READ              = 1 << 0;
        const PRESENT                = 1 << 1;
        const INDIRECT_ARGS          = 1 << 2;
        const VERTEX_OR_INDEX_BUFFER = 1 << 3;
        const SRV_COMPUTE            = 1 << 4;
        const SRV_GRAPHICS           = 1 << 5;
        const COPY_SRC               = 1 << 6;
        const RESOLVE_SRC            = 1 << 7;
        const DSV_READ               = 1 << 8;

        const UAV_COMPUTE            = 1 << 9;
        const UAV_GRAPHICS           = 1 << 10;
        const RTV                    = 1 << 11;
        const COPY_DST                = 1 << 12;
        const RESOLVE_DST             = 1 << 13;
        const DSV_WRITE               = 1 << 14;

        const DISCARD                = 1 << 15;

        const SRV_MASK = Self::SRV_COMPUTE.bits() | Self::SRV_GRAPHICS.bits();
        const UAV_MASK = Self::UAV_COMPUTE.bits() | Self::UAV_GRAPHICS.bits();

        const READ_ONLY_EXCLUSIVE_MASK = Self::CPU_READ.bits()
            | Self::PRESENT.bits()
            | Self::INDIRECT_ARGS.bits()
            | Self::VERTEX_OR_INDEX_BUFFER.bits()
            | Self::SRV_GRAPHICS.bits()
            | Self::SRV_COMPUTE.bits()
            | Self::COPY_SRC.bits()
            | Self::RESOLVE_SRC.bits();

        const READ_ONLY_MASK = Self::READ_ONLY_EXCLUSIVE_MASK.bits() | Self::DSV_READ.bits();

        const READABLE_MASK = Self::READ_ONLY_MASK.bits() | Self::UAV_MASK.bits();

        const WRITE_ONLY_EXCLUSIVE_MASK = Self::RTV.bits()
            | Self::COPY_DST.bits()
            | Self::RESOLVE_DST.bits();

        const WRITE_ONLY_MASK = Self::WRITE_ONLY_EXCLUSIVE_MASK.bits() | Self::DSV_WRITE.bits();

        const WRITABLE_MASK = Self::WRITE_ONLY_MASK.bits() | Self::UAV_MASK.bits();
    }
}

impl RhiAccess {
    /// `true` iff every set bit is in `READ_ONLY_EXCLUSIVE_MASK` and the
    /// flag set is non-empty (mirrors the original's
    /// `isReadOnlyExclusiveAccess`).
    pub fn is_read_only_exclusive(self) -> bool {
        self.intersects(Self::READ_ONLY_EXCLUSIVE_MASK)
            && !self.intersects(!Self::READ_ONLY_EXCLUSIVE_MASK)
    }

    /// `true` iff every set bit is in `READ_ONLY_MASK`.
    pub fn is_read_only(self) -> bool {
        self.intersects(Self::READ_ONLY_MASK) && !self.intersects(!Self::READ_ONLY_MASK)
    }

    /// `true` iff every set bit is in `WRITE_ONLY_MASK`.
    pub fn is_write_only(self) -> bool {
        self.intersects(Self::WRITE_ONLY_MASK) && !self.intersects(!Self::WRITE_ONLY_MASK)
    }

    /// `true` iff this access includes any writable bit (including UAV).
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE_MASK)
    }

    /// `true` iff this access includes any readable bit (including UAV).
    pub fn is_readable(self) -> bool {
        self.intersects(Self::READABLE_MASK)
    }

    /// An access is invalid if it mixes an exclusive-read flag with any
    /// writable flag, or an exclusive-write flag with any readable flag.
    pub fn is_invalid(self) -> bool {
        (self.intersects(Self::READ_ONLY_EXCLUSIVE_MASK) && self.intersects(Self::WRITABLE_MASK))
            || (self.intersects(Self::WRITE_ONLY_EXCLUSIVE_MASK)
                && self.intersects(Self::READABLE_MASK))
    }

    pub fn is_valid(self) -> bool {
        !self.is_invalid()
    }

    /// Whether a transition is required when moving from `self` (the
    /// previous access) to `next`.
    pub fn transition_required_to(self, next: RhiAccess) -> bool {
        if self == RhiAccess::UNKNOWN {
            return true;
        }
        if self == next {
            return false;
        }
        // Multiple read-only states may coexist without a barrier; any
        // writable state on either side forces a transition.
        self.is_writable() || next.is_writable()
    }
}

bitflags::bitflags! {
    /// Flags controlling how an RDG pass is scheduled and culled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RdgPassFlags: u16 {
        const NONE           = 0;
        const RASTER         = 1 << 0;
        const COMPUTE        = 1 << 1;
        const ASYNC_COMPUTE  = 1 << 2;
        const COPY           = 1 << 3;
        /// This pass (and its producers) is never culled even if unread.
        const NEVER_CULL     = 1 << 4;
        const SKIP_RENDER_PASS = 1 << 5;
        const NEVER_MERGE    = 1 << 6;
        const NEVER_PARALLEL = 1 << 7;
        const READBACK       = Self::COPY.bits() | Self::NEVER_CULL.bits();
    }
}

bitflags::bitflags! {
    /// Flags controlling lifetime/tracking behaviour of an RDG texture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RdgTextureFlags: u8 {
        const NONE = 0;
        const MULTI_FRAME = 1 << 0;
        const SKIP_TRACKING = 1 << 1;
        const FORCE_IMMEDIATE_FIRST_BARRIER = 1 << 2;
        const MAINTAIN_COMPRESSION = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Flags controlling lifetime/tracking behaviour of an RDG buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RdgBufferFlags: u8 {
        const NONE = 0;
        const MULTI_FRAME = 1 << 0;
        const SKIP_TRACKING = 1 << 1;
        const FORCE_IMMEDIATE_FIRST_BARRIER = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_always_requires_transition() {
        assert!(RhiAccess::UNKNOWN.transition_required_to(RhiAccess::RTV));
    }

    #[test]
    fn identical_read_states_need_no_transition() {
        assert!(!RhiAccess::SRV_GRAPHICS.transition_required_to(RhiAccess::SRV_GRAPHICS));
    }

    #[test]
    fn multiple_read_only_states_coexist() {
        // Two distinct read-only states: still no transition, since neither is writable.
        assert!(!RhiAccess::SRV_GRAPHICS.transition_required_to(RhiAccess::DSV_READ));
    }

    #[test]
    fn write_to_read_requires_transition() {
        assert!(RhiAccess::RTV.transition_required_to(RhiAccess::SRV_GRAPHICS));
    }

    #[test]
    fn read_only_exclusive_plus_write_is_invalid() {
        let mixed = RhiAccess::SRV_GRAPHICS | RhiAccess::RTV;
        assert!(mixed.is_invalid());
    }

    #[test]
    fn uav_is_both_readable_and_writable() {
        assert!(RhiAccess::UAV_GRAPHICS.is_readable());
        assert!(RhiAccess::UAV_GRAPHICS.is_writable());
        assert!(!RhiAccess::UAV_GRAPHICS.is_invalid());
    }

    #[test]
    fn dsv_read_plus_srv_is_valid_combination() {
        let combo = RhiAccess::DSV_READ | RhiAccess::SRV_GRAPHICS;
        assert!(combo.is_valid());
        assert!(combo.is_read_only());
        assert!(!combo.is_read_only_exclusive());
    }
}
