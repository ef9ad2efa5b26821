//! Render 回调上下文与 trampoline
//!
//! 每个打开的设备通过 `ContextHandle` 拥有一个 `RenderContext`
//! （堆分配，地址固定），平台只拿到一个指向它的 `RenderTarget`。
//! 用户回调保存在上下文里，不存在进程级的"当前回调"。

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::stats::RenderStats;

/// 用户回调：`(frame_count, channel_count, interleaved_buffer)`
///
/// 在平台的实时线程上执行：禁止分配、加锁、阻塞
pub type RenderCallback = Box<dyn FnMut(u32, u32, &mut [f32]) + Send + 'static>;

/// Render 回调上下文
///
/// 所有字段在 start 之前准备好，回调内不做任何分配
pub struct RenderContext {
    callback: UnsafeCell<RenderCallback>,
    channels: u32,
    stats: Arc<RenderStats>,
    /// 被 close 线程写入、被回调线程读取，独占一个 cache line
    running: CachePadded<AtomicBool>,
}

impl RenderContext {
    /// 停止转发：之后到达的回调只填零
    fn halt(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// 处理一次硬件 buffer 请求
    ///
    /// **绝对禁止：**
    /// - 锁
    /// - 分配
    /// - I/O
    ///
    /// # Safety
    ///
    /// 同一上下文上的调用必须串行（平台保证）
    ///
    /// 返回 false 表示没有调用用户回调，`data` 全部为零
    #[inline]
    unsafe fn render(&self, frames: u32, data: &mut [f32]) -> bool {
        if !self.running.load(Ordering::Acquire) {
            data.fill(0.0);
            self.stats.record_suppressed();
            return false;
        }

        let channels = self.channels as usize;
        let requested = frames as usize * channels;
        let usable = if data.len() < requested {
            self.stats.record_short_buffer();
            data.len() - data.len() % channels
        } else {
            requested
        };

        let (buffer, rest) = data.split_at_mut(usable);
        rest.fill(0.0);

        let frames = (usable / channels) as u32;
        if frames == 0 {
            return false;
        }

        let callback = &mut *self.callback.get();
        callback(frames, self.channels, buffer);
        self.stats.on_callback(frames);
        true
    }
}

/// `RenderContext` 的所有者
///
/// 上下文经 `Box::into_raw` 交出，之后只以裸指针存在；
/// 移动句柄不会触碰平台线程正在读取的那块内存。
/// 句柄 drop 时才 `Box::from_raw` 回收，调用者保证此时平台已 dispose
pub struct ContextHandle {
    context: NonNull<RenderContext>,
}

// 用户回调是 Send，其余字段是原子量
unsafe impl Send for ContextHandle {}

impl ContextHandle {
    pub fn new(callback: RenderCallback, channels: u32, stats: Arc<RenderStats>) -> Self {
        let context = Box::into_raw(Box::new(RenderContext {
            callback: UnsafeCell::new(callback),
            channels,
            stats,
            running: CachePadded::new(AtomicBool::new(true)),
        }));
        // SAFETY: Box::into_raw 永远不返回空指针
        let context = unsafe { NonNull::new_unchecked(context) };
        Self { context }
    }

    /// 平台侧使用的不透明句柄
    ///
    /// 在本句柄 drop 之前有效
    pub fn target(&self) -> RenderTarget {
        RenderTarget {
            context: self.context,
        }
    }

    /// 停止转发：之后到达的回调只填零
    pub fn halt(&self) {
        // SAFETY: 上下文在 drop 之前一直存活
        unsafe { self.context.as_ref() }.halt();
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        // SAFETY: 指针来自 new 中的 Box::into_raw，且只回收一次
        unsafe { drop(Box::from_raw(self.context.as_ptr())) };
    }
}

/// 交给平台的渲染目标
///
/// 带类型的 ref-con 指针
#[derive(Clone, Copy, Debug)]
pub struct RenderTarget {
    context: NonNull<RenderContext>,
}

// 上下文只通过串行的平台回调和原子标志访问
unsafe impl Send for RenderTarget {}

impl RenderTarget {
    /// 以裸指针形式传给 C 回调的 ref-con
    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.context.as_ptr().cast()
    }

    /// 从 C 回调的 ref-con 恢复
    ///
    /// # Safety
    ///
    /// `ptr` 必须来自 `as_ptr()`，且上下文仍然存活
    pub unsafe fn from_ptr(ptr: *mut std::ffi::c_void) -> Option<Self> {
        NonNull::new(ptr.cast()).map(|context| Self { context })
    }

    /// 调用用户回调填充 `data`，返回是否真的转发给了用户回调
    ///
    /// # Safety
    ///
    /// - 上下文必须仍然存活（设备在 dispose 之后才释放它）
    /// - 对同一目标的调用不能并发
    #[inline]
    pub unsafe fn render(&self, frames: u32, data: &mut [f32]) -> bool {
        self.context.as_ref().render(frames, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_context(channels: u32) -> (ContextHandle, Arc<RenderStats>, Arc<AtomicU32>) {
        let stats = Arc::new(RenderStats::new());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_cb = Arc::clone(&calls);
        let ctx = ContextHandle::new(
            Box::new(move |frames: u32, ch: u32, buf: &mut [f32]| {
                assert_eq!(buf.len(), frames as usize * ch as usize);
                buf.fill(0.5);
                calls_cb.fetch_add(1, Ordering::Relaxed);
            }),
            channels,
            Arc::clone(&stats),
        );
        (ctx, stats, calls)
    }

    #[test]
    fn test_render_forwards_to_callback() {
        let (ctx, stats, calls) = counting_context(2);
        let target = ctx.target();

        let mut buf = vec![0.0f32; 64];
        assert!(unsafe { target.render(32, &mut buf) });

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(buf.iter().all(|&s| s == 0.5));
        assert_eq!(stats.frames_rendered(), 32);
    }

    #[test]
    fn test_render_after_halt_zero_fills() {
        let (ctx, stats, calls) = counting_context(2);
        let target = ctx.target();
        ctx.halt();

        let mut buf = vec![1.0f32; 64];
        assert!(!unsafe { target.render(32, &mut buf) });

        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert!(buf.iter().all(|&s| s == 0.0));
        assert_eq!(stats.suppressed_count(), 1);
    }

    #[test]
    fn test_short_buffer_uses_whole_frames() {
        let (ctx, stats, calls) = counting_context(2);
        let target = ctx.target();

        // 请求 32 帧，但只给了 15 个样本 → 7 帧 + 1 个填零
        let mut buf = vec![1.0f32; 15];
        unsafe { target.render(32, &mut buf) };

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(stats.short_buffer_count(), 1);
        assert_eq!(stats.frames_rendered(), 7);
        assert_eq!(buf[14], 0.0);
        assert!(buf[..14].iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_ref_con_roundtrip() {
        let (ctx, _stats, calls) = counting_context(1);
        let ptr = ctx.target().as_ptr();
        let target = unsafe { RenderTarget::from_ptr(ptr) }.unwrap();

        let mut buf = vec![0.0f32; 8];
        unsafe { target.render(8, &mut buf) };
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(unsafe { RenderTarget::from_ptr(std::ptr::null_mut()) }.is_none());
    }

    #[test]
    fn test_handle_move_keeps_target_valid() {
        let (ctx, stats, calls) = counting_context(2);
        let target = ctx.target();

        // 句柄换了位置，上下文地址不变
        let moved = vec![ctx];
        let mut buf = vec![0.0f32; 16];
        assert!(unsafe { target.render(8, &mut buf) });
        assert_eq!(moved[0].target().as_ptr(), target.as_ptr());

        drop(moved);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        // 上下文已回收，只剩测试持有的 stats
        assert_eq!(Arc::strong_count(&stats), 1);
    }

    #[test]
    fn test_zero_frames_skips_callback() {
        let (ctx, stats, calls) = counting_context(2);
        let mut buf = vec![1.0f32; 1];
        assert!(!unsafe { ctx.target().render(4, &mut buf) });
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(buf[0], 0.0);
        assert_eq!(stats.short_buffer_count(), 1);
    }
}
