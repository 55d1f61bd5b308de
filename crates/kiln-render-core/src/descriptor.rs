use std::collections::VecDeque;
use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use kiln_gfx::desc::{
    DescriptorBindingDesc, DescriptorInfo, DescriptorPoolDesc, DescriptorSetLayoutDesc, DescriptorWrite, SamplerDesc,
};
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::error::{GfxError, GfxResult, log_creation_error};
use kiln_gfx::flags::{BindlessCategory, DescriptorKind};
use rustc_hash::FxHashMap;

use crate::device::RenderTexture;
use crate::frame_counter::FrameCounter;
use crate::free_list::{SlotId, VersionedFreeList};
use crate::handles::Uid;
use crate::settings::CoreSettings;

const SHADER_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::ALL_GRAPHICS;

/// pooled 路径中 pool 与 layout 的 key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub kind: DescriptorKind,
    /// binding 的数量，binding `i` 只有一个元素
    pub count: u32,
}

/// bindless 表中的位置，shader 直接使用 [`BindlessIndex::index`] 索引
///
/// slot 被复用之后 version 会变化，旧的 index 可以通过 [`DescriptorManager::is_bindless_current`] 识别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindlessIndex {
    pub category: BindlessCategory,
    pub slot: SlotId,
}

impl BindlessIndex {
    #[inline]
    pub fn index(&self) -> u32 {
        self.slot.index
    }
}

/// 同一个 `(kind, count)` 的所有 set
///
/// set 按 chunk 预先分配，每个 chunk 是一个 descriptor pool
struct SetPool {
    layout: vk::DescriptorSetLayout,
    chunks: Vec<vk::DescriptorPool>,
    /// 下标即 slot index
    sets: Vec<vk::DescriptorSet>,
    free_list: VersionedFreeList,
    /// slot 当前缓存的 uid 列表；None 表示空闲或者正在等待释放
    slot_uids: Vec<Option<Vec<Uid>>>,
}

impl SetPool {
    fn new(driver: &dyn GfxDriver, key: PoolKey) -> GfxResult<Self> {
        let bindings = (0..key.count)
            .map(|binding| DescriptorBindingDesc {
                binding,
                ty: key.kind.to_vk(),
                count: 1,
                stages: SHADER_STAGES,
            })
            .collect_vec();
        let layout = driver
            .create_descriptor_set_layout(&DescriptorSetLayoutDesc {
                bindings: &bindings,
                update_after_bind: false,
                name: &format!("pooled-{:?}x{}", key.kind, key.count),
            })
            .map_err(log_creation_error("descriptor set layout"))?;
        Ok(Self {
            layout,
            chunks: vec![],
            sets: vec![],
            free_list: VersionedFreeList::default(),
            slot_uids: vec![],
        })
    }

    /// 追加一个 descriptor pool，并预先分配其中所有的 set
    fn grow(&mut self, driver: &dyn GfxDriver, key: PoolKey, sets_per_pool: u32) -> GfxResult<()> {
        let name = format!("pooled-{:?}x{}-{}", key.kind, key.count, self.chunks.len());
        let pool = driver
            .create_descriptor_pool(&DescriptorPoolDesc {
                max_sets: sets_per_pool,
                sizes: &[vk::DescriptorPoolSize {
                    ty: key.kind.to_vk(),
                    descriptor_count: key.count * sets_per_pool,
                }],
                update_after_bind: false,
                name: &name,
            })
            .map_err(log_creation_error("descriptor pool"))?;
        let layouts = vec![self.layout; sets_per_pool as usize];
        let sets = match driver.allocate_descriptor_sets(pool, &layouts, None) {
            Ok(sets) => sets,
            Err(e) => {
                driver.destroy_descriptor_pool(pool);
                return Err(log_creation_error("descriptor set")(e));
            }
        };
        log::info!("create descriptor pool {} with {} sets", name, sets_per_pool);

        self.chunks.push(pool);
        self.sets.extend(sets);
        self.slot_uids.resize(self.sets.len(), None);
        self.free_list.grow(sets_per_pool);
        Ok(())
    }

    fn destroy(self, driver: &dyn GfxDriver) {
        for pool in self.chunks {
            driver.destroy_descriptor_pool(pool);
        }
        driver.destroy_descriptor_set_layout(self.layout);
    }
}

/// 一个持久的 update after bind 的 descriptor set，三个 binding 分别对应三个分类
struct BindlessTable {
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    capacity: u32,

    /// 由 [`BindlessCategory::index`] 索引
    free_lists: [VersionedFreeList; 3],
    by_uid: FxHashMap<Uid, BindlessIndex>,

    sampler: vk::Sampler,
    depth_compare_sampler: vk::Sampler,
}

impl BindlessTable {
    fn new(driver: &dyn GfxDriver, capacity: u32) -> GfxResult<Self> {
        let bindings = BindlessCategory::ALL.map(|category| DescriptorBindingDesc {
            binding: category.binding(),
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: capacity,
            stages: SHADER_STAGES,
        });
        let layout = driver
            .create_descriptor_set_layout(&DescriptorSetLayoutDesc {
                bindings: &bindings,
                update_after_bind: true,
                name: "bindless",
            })
            .map_err(log_creation_error("bindless descriptor set layout"))?;
        let pool = driver
            .create_descriptor_pool(&DescriptorPoolDesc {
                max_sets: 1,
                sizes: &[vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: capacity * BindlessCategory::ALL.len() as u32,
                }],
                update_after_bind: true,
                name: "bindless",
            })
            .map_err(log_creation_error("bindless descriptor pool"))?;
        let set = driver
            .allocate_descriptor_sets(pool, &[layout], Some(capacity))
            .map_err(log_creation_error("bindless descriptor set"))?
            .into_iter()
            .next()
            .ok_or(GfxError::InvalidHandle("bindless descriptor set"))?;

        let sampler = driver
            .create_sampler(&SamplerDesc::default(), "bindless-default")
            .map_err(log_creation_error("sampler"))?;
        let depth_compare_sampler = driver
            .create_sampler(&SamplerDesc::depth_compare(), "bindless-depth-compare")
            .map_err(log_creation_error("sampler"))?;

        log::info!("create bindless table with {} slots per category", capacity);
        Ok(Self {
            layout,
            pool,
            set,
            capacity,
            free_lists: std::array::from_fn(|_| VersionedFreeList::with_capacity(capacity)),
            by_uid: FxHashMap::default(),
            sampler,
            depth_compare_sampler,
        })
    }

    fn destroy(self, driver: &dyn GfxDriver) {
        driver.destroy_sampler(self.sampler);
        driver.destroy_sampler(self.depth_compare_sampler);
        driver.destroy_descriptor_pool(self.pool);
        driver.destroy_descriptor_set_layout(self.layout);
    }
}

enum PendingRelease {
    Pooled(PoolKey, SlotId),
    Bindless(BindlessIndex),
}

/// descriptor set 的缓存与失效
///
/// - pooled：按 `(kind, count)` 分组，set 以 uid 列表为 key 缓存
/// - bindless：一个大的 set，纹理第一次使用时分配 index 并写入
///
/// 两条路径中被释放的 slot 都要等待 [`FrameCounter::FIF_COUNT`] 帧之后才能复用，
/// 保证 in-flight 的提交引用的 set 不会被改写
pub struct DescriptorManager {
    driver: Rc<dyn GfxDriver>,

    sets_per_pool: u32,
    max_pool_binding_count: u32,

    pools: FxHashMap<PoolKey, SetPool>,
    cache: FxHashMap<(PoolKey, Vec<Uid>), SlotId>,
    /// uid 出现在哪些 slot 中，用于失效
    uid_refs: FxHashMap<Uid, Vec<(PoolKey, SlotId)>>,

    bindless: Option<BindlessTable>,

    pending_release: VecDeque<(u64, PendingRelease)>,

    destroyed: bool,
}

// new & init
impl DescriptorManager {
    pub fn new(driver: Rc<dyn GfxDriver>, settings: &CoreSettings) -> GfxResult<Self> {
        let bindless = match settings.bindless_capacity(driver.caps()) {
            Some(capacity) => Some(BindlessTable::new(driver.as_ref(), capacity)?),
            None => None,
        };
        Ok(Self {
            driver,
            sets_per_pool: settings.descriptor_sets_per_pool.max(1),
            max_pool_binding_count: settings.max_pool_binding_count,
            pools: FxHashMap::default(),
            cache: FxHashMap::default(),
            uid_refs: FxHashMap::default(),
            bindless,
            pending_release: VecDeque::new(),
            destroyed: false,
        })
    }
}

// destroy
impl DescriptorManager {
    /// 调用之前 GPU 必须处于 idle 状态
    pub fn destroy(&mut self) {
        log::info!("destroy descriptor manager: {} pooled layouts", self.pools.len());
        for (_, pool) in self.pools.drain() {
            pool.destroy(self.driver.as_ref());
        }
        if let Some(table) = self.bindless.take() {
            table.destroy(self.driver.as_ref());
        }
        self.cache.clear();
        self.uid_refs.clear();
        self.pending_release.clear();
        self.destroyed = true;
    }
}
impl Drop for DescriptorManager {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "DescriptorManager dropped without destroy");
        }
    }
}

// getters
impl DescriptorManager {
    #[inline]
    pub fn is_bindless_enabled(&self) -> bool {
        self.bindless.is_some()
    }

    /// bindless 的 set，每帧只需要绑定一次
    #[inline]
    pub fn bindless_set(&self) -> Option<vk::DescriptorSet> {
        self.bindless.as_ref().map(|table| table.set)
    }

    #[inline]
    pub fn bindless_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.bindless.as_ref().map(|table| table.layout)
    }

    #[inline]
    pub fn bindless_capacity(&self) -> Option<u32> {
        self.bindless.as_ref().map(|table| table.capacity)
    }

    /// 已经缓存的 set，不会创建新的 set
    pub fn cached_descriptor_set(&self, kind: DescriptorKind, uids: &[Uid]) -> Option<vk::DescriptorSet> {
        let key = PoolKey {
            kind,
            count: uids.len() as u32,
        };
        let slot = self.cache.get(&(key, uids.to_vec()))?;
        self.pools.get(&key).map(|pool| pool.sets[slot.index as usize])
    }

    /// 旧的 bindless index 是否仍然指向同一个纹理
    pub fn is_bindless_current(&self, index: BindlessIndex) -> bool {
        self.bindless
            .as_ref()
            .is_some_and(|table| table.free_lists[index.category.index()].is_current(index.slot))
    }

    #[inline]
    pub fn pending_release_count(&self) -> usize {
        self.pending_release.len()
    }

    /// 引用 `uid` 的 pooled slot 数量
    #[inline]
    pub fn uid_ref_count(&self, uid: Uid) -> usize {
        self.uid_refs.get(&uid).map_or(0, |refs| refs.len())
    }
}

// pooled
impl DescriptorManager {
    /// `(kind, count)` 对应的 layout，第一次使用时创建
    pub fn layout_for(&mut self, kind: DescriptorKind, count: u32) -> GfxResult<vk::DescriptorSetLayout> {
        let key = PoolKey { kind, count };
        Ok(self.pool_for(key)?.layout)
    }

    fn pool_for(&mut self, key: PoolKey) -> GfxResult<&mut SetPool> {
        assert!(
            key.count > 0 && key.count <= self.max_pool_binding_count,
            "descriptor binding count {} exceeds the pool maximum {}",
            key.count,
            self.max_pool_binding_count
        );
        if !self.pools.contains_key(&key) {
            let pool = SetPool::new(self.driver.as_ref(), key)?;
            self.pools.insert(key, pool);
        }
        self.pools.get_mut(&key).ok_or(GfxError::InvalidHandle("descriptor pool"))
    }

    /// 每个 binding 写入一个同类型的 descriptor，`uids` 与 `infos` 一一对应
    ///
    /// 相同的 uid 列表返回缓存的 set
    pub fn get_single_type_descriptor_set(
        &mut self,
        kind: DescriptorKind,
        uids: &[Uid],
        infos: &[DescriptorInfo],
    ) -> GfxResult<vk::DescriptorSet> {
        assert_eq!(uids.len(), infos.len(), "each descriptor needs a uid");
        let key = PoolKey {
            kind,
            count: uids.len() as u32,
        };
        if let Some(set) = self.cached_descriptor_set(kind, uids) {
            return Ok(set);
        }

        let driver = self.driver.clone();
        let sets_per_pool = self.sets_per_pool;
        let pool = self.pool_for(key)?;
        let slot = match pool.free_list.allocate() {
            Some(slot) => slot,
            None => {
                pool.grow(driver.as_ref(), key, sets_per_pool)?;
                pool.free_list.allocate().ok_or(GfxError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?
            }
        };
        let set = pool.sets[slot.index as usize];

        let writes = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| DescriptorWrite {
                set,
                binding: binding as u32,
                array_element: 0,
                ty: kind.to_vk(),
                info: *info,
            })
            .collect_vec();
        driver.update_descriptor_sets(&writes);
        pool.slot_uids[slot.index as usize] = Some(uids.to_vec());

        self.cache.insert((key, uids.to_vec()), slot);
        for uid in uids.iter().unique() {
            self.uid_refs.entry(*uid).or_default().push((key, slot));
        }
        Ok(set)
    }
}

// bindless
impl DescriptorManager {
    /// 纹理在 bindless 表中的 index，第一次调用时分配并写入
    pub fn get_texture_descriptor(&mut self, texture: &RenderTexture) -> BindlessIndex {
        let Some(table) = self.bindless.as_mut() else {
            panic!("bindless is not enabled");
        };
        assert!(texture.is_sampled(), "texture {} is not sampleable", texture.name());
        if let Some(index) = table.by_uid.get(&texture.uid()) {
            return *index;
        }

        let category = texture.bindless_category();
        let slot = table.free_lists[category.index()].allocate().unwrap_or_else(|| {
            panic!("bindless table for {:?} is exhausted ({} slots)", category, table.capacity)
        });
        let sampler = match category {
            BindlessCategory::DepthCompare => table.depth_compare_sampler,
            BindlessCategory::Texture2D | BindlessCategory::TextureCube => table.sampler,
        };
        self.driver.update_descriptor_sets(&[DescriptorWrite {
            set: table.set,
            binding: category.binding(),
            array_element: slot.index,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info: DescriptorInfo::Image {
                sampler,
                view: texture.view(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        }]);

        let index = BindlessIndex { category, slot };
        table.by_uid.insert(texture.uid(), index);
        index
    }
}

// invalidation
impl DescriptorManager {
    /// 纹理销毁时调用，使 pooled 与 bindless 中引用它的 slot 失效
    ///
    /// 必须在 uid 对应的资源被销毁之前同步调用
    pub fn on_texture_destroy(&mut self, uid: Uid, frame_id: u64) {
        self.on_resource_destroy(uid, frame_id);
        if let Some(index) = self.bindless.as_mut().and_then(|table| table.by_uid.remove(&uid)) {
            self.pending_release.push_back((frame_id, PendingRelease::Bindless(index)));
        }
    }

    /// buffer 与纹理共用的 pooled 路径失效
    pub fn on_resource_destroy(&mut self, uid: Uid, frame_id: u64) {
        let Some(refs) = self.uid_refs.remove(&uid) else {
            return;
        };
        for (key, slot) in refs {
            let Some(pool) = self.pools.get_mut(&key) else {
                continue;
            };
            // slot 已经被复用，或者已经因为另一个 uid 进入了释放队列
            if !pool.free_list.is_current(slot) {
                continue;
            }
            let Some(uids) = pool.slot_uids[slot.index as usize].take() else {
                continue;
            };
            // 同一个 set 中的其他 uid 不再引用这个 slot
            for other in uids.iter().filter(|other| **other != uid) {
                if let Some(other_refs) = self.uid_refs.get_mut(other) {
                    other_refs.retain(|r| *r != (key, slot));
                    if other_refs.is_empty() {
                        self.uid_refs.remove(other);
                    }
                }
            }
            self.cache.remove(&(key, uids));
            self.pending_release.push_back((frame_id, PendingRelease::Pooled(key, slot)));
        }
    }

    /// 归还在 [`FrameCounter::FIF_COUNT`] 帧之前失效的 slot
    pub fn process_releases(&mut self, frame_counter: &FrameCounter) {
        while let Some((frame, _)) = self.pending_release.front() {
            if !frame_counter.is_retired(*frame) {
                break;
            }
            let Some((_, release)) = self.pending_release.pop_front() else {
                break;
            };
            match release {
                PendingRelease::Pooled(key, slot) => {
                    if let Some(pool) = self.pools.get_mut(&key) {
                        pool.free_list.release(slot);
                    }
                }
                PendingRelease::Bindless(index) => {
                    if let Some(table) = self.bindless.as_mut() {
                        table.free_lists[index.category.index()].release(index.slot);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_gfx::fake::FakeDriver;

    use crate::handles::UidAllocator;

    fn manager(settings: CoreSettings) -> (Rc<FakeDriver>, DescriptorManager) {
        let fake = Rc::new(FakeDriver::new());
        let manager = DescriptorManager::new(fake.clone(), &settings).unwrap();
        (fake, manager)
    }

    fn buffer_info() -> DescriptorInfo {
        DescriptorInfo::Buffer {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    #[test]
    fn test_pooled_cache_hit() {
        let (fake, mut manager) = manager(CoreSettings::default());
        let mut uids = UidAllocator::default();
        let (a, b) = (uids.next(), uids.next());

        let set = manager
            .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[a, b], &[buffer_info(); 2])
            .unwrap();
        let again = manager
            .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[a, b], &[buffer_info(); 2])
            .unwrap();
        assert_eq!(set, again);
        assert_eq!(fake.stats().descriptor_writes, 2);

        // 顺序不同是不同的 set
        let swapped = manager
            .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[b, a], &[buffer_info(); 2])
            .unwrap();
        assert_ne!(set, swapped);
        manager.destroy();
        assert_eq!(fake.live_object_count(), 0);
    }

    #[test]
    fn test_pool_grows_by_chunk() {
        let (fake, mut manager) = manager(CoreSettings {
            descriptor_sets_per_pool: 2,
            ..Default::default()
        });
        let mut uids = UidAllocator::default();
        for _ in 0..5 {
            manager
                .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[uids.next()], &[buffer_info()])
                .unwrap();
        }
        // bindless 表占用一个 pool
        assert_eq!(fake.stats().descriptor_pools_created, 3 + 1);
        manager.destroy();
    }

    #[test]
    fn test_release_waits_for_frames() {
        let (_fake, mut manager) = manager(CoreSettings {
            descriptor_sets_per_pool: 1,
            ..Default::default()
        });
        let mut uids = UidAllocator::default();
        let (a, b) = (uids.next(), uids.next());
        let mut frames = FrameCounter::default();

        let set_a = manager
            .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[a], &[buffer_info()])
            .unwrap();
        manager.on_resource_destroy(a, frames.frame_id());
        assert!(manager.cached_descriptor_set(DescriptorKind::UniformBuffer, &[a]).is_none());

        for _ in 0..FrameCounter::FIF_COUNT {
            frames.next_frame();
            manager.process_releases(&frames);
        }
        assert_eq!(manager.pending_release_count(), 0);

        // 释放之后同一个 set 被复用
        let set_b = manager
            .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[b], &[buffer_info()])
            .unwrap();
        assert_eq!(set_a, set_b);
        manager.destroy();
    }

    #[test]
    fn test_shared_slot_released_once() {
        let (_fake, mut manager) = manager(CoreSettings::default());
        let mut uids = UidAllocator::default();
        let (a, b) = (uids.next(), uids.next());
        manager
            .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[a, b], &[buffer_info(); 2])
            .unwrap();
        manager.on_resource_destroy(a, 0);
        manager.on_resource_destroy(b, 0);
        assert_eq!(manager.pending_release_count(), 1);
        manager.destroy();
    }

    #[test]
    fn test_long_lived_uid_refs_stay_bounded() {
        let (_fake, mut manager) = manager(CoreSettings::default());
        let mut uids = UidAllocator::default();
        let long_lived = uids.next();
        let mut frames = FrameCounter::default();

        for _ in 0..1000 {
            let transient = uids.next();
            manager
                .get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &[long_lived, transient], &[buffer_info(); 2])
                .unwrap();
            manager.on_resource_destroy(transient, frames.frame_id());
            assert_eq!(manager.uid_ref_count(transient), 0);
            frames.next_frame();
            manager.process_releases(&frames);
        }
        assert_eq!(manager.uid_ref_count(long_lived), 0);
        assert!(manager.pending_release_count() <= FrameCounter::FIF_COUNT);
        manager.destroy();
    }

    #[test]
    #[should_panic(expected = "exceeds the pool maximum")]
    fn test_binding_count_above_maximum() {
        let (_fake, mut manager) = manager(CoreSettings {
            max_pool_binding_count: 1,
            ..Default::default()
        });
        let mut uids = UidAllocator::default();
        let _ = manager.get_single_type_descriptor_set(
            DescriptorKind::UniformBuffer,
            &[uids.next(), uids.next()],
            &[buffer_info(); 2],
        );
    }

    #[test]
    fn test_bindless_gated_by_settings() {
        let (_fake, mut manager) = manager(CoreSettings {
            enable_bindless: false,
            ..Default::default()
        });
        assert!(!manager.is_bindless_enabled());
        assert!(manager.bindless_set().is_none());
        manager.destroy();

        let (_fake, mut manager) = manager_with_caps();
        assert!(!manager.is_bindless_enabled());
        manager.destroy();
    }

    fn manager_with_caps() -> (Rc<FakeDriver>, DescriptorManager) {
        let caps = kiln_gfx::caps::GfxCaps {
            descriptor_indexing: false,
            ..FakeDriver::default_caps()
        };
        let fake = Rc::new(FakeDriver::with_caps(caps));
        let manager = DescriptorManager::new(fake.clone(), &CoreSettings::default()).unwrap();
        (fake, manager)
    }
}
