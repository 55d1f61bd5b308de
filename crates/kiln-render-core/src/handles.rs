//! 资源句柄以及 UID
//!
//! 句柄是 [`crate::device::RenderDevice`] 中 slot map 的 key，拥有权在 device；
//! UID 只作为 cache 的 key 使用，单调递增且永不复用。

use std::fmt::Display;

slotmap::new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
}

/// 32 位单调递增的资源标识，只用作 cache key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(u32);

impl Uid {
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// UID 的发放器
#[derive(Debug, Default)]
pub struct UidAllocator {
    next: u32,
}

impl UidAllocator {
    /// UID 从 1 开始发放
    pub fn next(&mut self) -> Uid {
        self.next = self.next.checked_add(1).expect("uid space exhausted");
        Uid(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_monotonic() {
        let mut allocator = UidAllocator::default();
        let a = allocator.next();
        let b = allocator.next();
        assert!(b > a);
        assert_eq!(a.raw(), 1);
        assert_eq!(b.to_string(), "#2");
    }
}
