use crate::settings::FrameLabel;

/// 帧计数器
///
/// 帧序号只增不减，用于 destroy queue 与 descriptor 释放队列的 frame tag
pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64) -> Self {
        Self { frame_id: init_frame_id }
    }
}
impl Default for FrameCounter {
    fn default() -> Self {
        Self::new(0)
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
// getters
impl FrameCounter {
    /// 同时处于 in-flight 状态的帧数
    pub const FIF_COUNT: usize = 3;

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
    #[inline]
    pub const fn fif_count() -> usize {
        Self::FIF_COUNT
    }
    #[inline]
    pub const fn frame_labels() -> [FrameLabel; Self::FIF_COUNT] {
        [FrameLabel::A, FrameLabel::B, FrameLabel::C]
    }
    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        FrameLabel::from_usize(self.frame_id as usize % Self::fif_count())
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }

    /// 在 `tagged_frame` 中登记的对象，到当前帧是否已经不会再被 GPU 使用
    ///
    /// 当前帧开始前已经等待过 `FIF_COUNT` 帧之前的提交
    #[inline]
    pub fn is_retired(&self, tagged_frame: u64) -> bool {
        tagged_frame + Self::FIF_COUNT as u64 <= self.frame_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_cycle() {
        let mut counter = FrameCounter::default();
        let mut labels = vec![];
        for _ in 0..4 {
            labels.push(*counter.frame_label());
            counter.next_frame();
        }
        assert_eq!(labels, vec![0, 1, 2, 0]);
        assert_eq!(counter.frame_name(), "[F4B]");
    }

    #[test]
    fn test_retire_after_fif_frames() {
        let mut counter = FrameCounter::new(10);
        assert!(!counter.is_retired(10));
        counter.next_frame();
        counter.next_frame();
        assert!(!counter.is_retired(10));
        counter.next_frame();
        assert!(counter.is_retired(10));
        assert!(!counter.is_retired(11));
    }
}
