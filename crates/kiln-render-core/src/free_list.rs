/// free list 中的一个 slot，version 用于识别失效的外部引用
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub index: u32,
    pub version: u32,
}

#[derive(Clone, Copy, Debug)]
enum SlotState {
    Free { next: Option<u32> },
    Live,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    version: u32,
    state: SlotState,
}

/// 带版本号的 free list
///
/// 每次 slot 被重新分配时 version 加一，持有旧 [`SlotId`] 的一方可以据此判断 slot 已经被复用。
/// 空闲的 slot 通过 `next` 串成链表，后释放的先分配。
#[derive(Debug, Default)]
pub struct VersionedFreeList {
    slots: Vec<Slot>,
    head: Option<u32>,
    live_count: u32,
}

// new & init
impl VersionedFreeList {
    pub fn with_capacity(capacity: u32) -> Self {
        let mut list = Self::default();
        list.grow(capacity);
        list
    }

    /// 追加 `additional` 个空闲 slot，新 slot 的 index 紧接在已有 slot 之后
    pub fn grow(&mut self, additional: u32) {
        let start = self.slots.len() as u32;
        self.slots.resize(
            (start + additional) as usize,
            Slot {
                version: 0,
                state: SlotState::Free { next: None },
            },
        );
        // 倒序压入链表头，使得 index 小的先被分配
        for index in (start..start + additional).rev() {
            self.slots[index as usize].state = SlotState::Free { next: self.head };
            self.head = Some(index);
        }
    }
}

// tools
impl VersionedFreeList {
    /// 没有空闲的 slot 时返回 None
    pub fn allocate(&mut self) -> Option<SlotId> {
        let index = self.head?;
        let slot = &mut self.slots[index as usize];
        let SlotState::Free { next } = slot.state else {
            unreachable!("slot {} in the free chain is live", index);
        };
        self.head = next;
        slot.version = slot.version.wrapping_add(1);
        slot.state = SlotState::Live;
        self.live_count += 1;
        Some(SlotId {
            index,
            version: slot.version,
        })
    }

    /// 归还 slot；id 已经失效（被释放过或者 version 不匹配）时返回 false
    pub fn release(&mut self, id: SlotId) -> bool {
        if !self.is_current(id) {
            return false;
        }
        self.slots[id.index as usize].state = SlotState::Free { next: self.head };
        self.head = Some(id.index);
        self.live_count -= 1;
        true
    }

    /// id 是否仍然指向一个存活的 slot
    #[inline]
    pub fn is_current(&self, id: SlotId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.version == id.version && matches!(slot.state, SlotState::Live))
    }
}

// getters
impl VersionedFreeList {
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }
    #[inline]
    pub fn live_count(&self) -> u32 {
        self.live_count
    }
    #[inline]
    pub fn is_full(&self) -> bool {
        self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_in_index_order() {
        let mut list = VersionedFreeList::with_capacity(3);
        let ids: Vec<u32> = (0..3).map(|_| list.allocate().unwrap().index).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(list.allocate().is_none());
        assert!(list.is_full());
    }

    #[test]
    fn test_reuse_bumps_version() {
        let mut list = VersionedFreeList::with_capacity(2);
        let a = list.allocate().unwrap();
        assert!(list.release(a));
        let b = list.allocate().unwrap();

        assert_eq!(a.index, b.index);
        assert_ne!(a.version, b.version);
        assert!(!list.is_current(a));
        assert!(list.is_current(b));
        // 旧的 id 不能释放新的 slot
        assert!(!list.release(a));
        assert_eq!(list.live_count(), 1);
    }

    #[test]
    fn test_double_release() {
        let mut list = VersionedFreeList::with_capacity(1);
        let a = list.allocate().unwrap();
        assert!(list.release(a));
        assert!(!list.release(a));
        assert_eq!(list.live_count(), 0);
    }

    #[test]
    fn test_grow_appends_slots() {
        let mut list = VersionedFreeList::with_capacity(1);
        let _ = list.allocate().unwrap();
        assert!(list.allocate().is_none());
        list.grow(2);
        assert_eq!(list.capacity(), 3);
        assert_eq!(list.allocate().unwrap().index, 1);
        assert_eq!(list.allocate().unwrap().index, 2);
    }
}
