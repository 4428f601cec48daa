use vmt::{FenceId, Identifier};

/// A resource value tagged with the parent it was carved from and the fence
/// that must retire before it can be reused (spec.md §3).
#[derive(Debug, Clone)]
pub struct ResourceObject<T> {
    pub parent_id: Identifier,
    pub fence_id: FenceId,
    pub value: T,
}
