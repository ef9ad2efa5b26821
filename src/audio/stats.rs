//! 渲染统计
//!
//! 计数器在 render callback 内更新，全部是 Relaxed 原子操作，
//! 不加锁、不分配

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 渲染统计收集器
#[derive(Debug, Default)]
pub struct RenderStats {
    callback_count: AtomicU64,
    frames_rendered: AtomicU64,
    // stop 之后仍被平台调用、未转发给用户回调的次数
    suppressed_count: AtomicU64,
    // 平台给的 buffer 比 frames × channels 小
    short_buffer_count: AtomicU64,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用户回调被调用一次
    #[inline]
    pub fn on_callback(&self, frames: u32) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);
        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_suppressed(&self) {
        self.suppressed_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_short_buffer(&self) {
        self.short_buffer_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn short_buffer_count(&self) -> u64 {
        self.short_buffer_count.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, sample_rate: f64) -> StatsReport {
        let frames_rendered = self.frames_rendered();
        let seconds_rendered = if sample_rate > 0.0 {
            frames_rendered as f64 / sample_rate
        } else {
            0.0
        };

        StatsReport {
            callbacks: self.callback_count(),
            frames_rendered,
            seconds_rendered,
            suppressed: self.suppressed_count(),
            short_buffers: self.short_buffer_count(),
        }
    }
}

/// 统计报告（快照）
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsReport {
    pub callbacks: u64,
    pub frames_rendered: u64,
    pub seconds_rendered: f64,
    pub suppressed: u64,
    pub short_buffers: u64,
}

impl StatsReport {
    /// 平均每次回调的帧数
    pub fn average_frames_per_callback(&self) -> f64 {
        if self.callbacks == 0 {
            return 0.0;
        }
        self.frames_rendered as f64 / self.callbacks as f64
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Render Statistics ===")?;
        writeln!(f, "Callbacks:        {}", self.callbacks)?;
        writeln!(
            f,
            "Frames rendered:  {} ({:.2}s)",
            self.frames_rendered, self.seconds_rendered
        )?;
        writeln!(
            f,
            "Frames/callback:  {:.1}",
            self.average_frames_per_callback()
        )?;
        writeln!(f, "Suppressed:       {}", self.suppressed)?;
        write!(f, "Short buffers:    {}", self.short_buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let stats = RenderStats::new();
        stats.on_callback(512);
        stats.on_callback(512);
        stats.record_suppressed();
        stats.record_short_buffer();

        let report = stats.report(48000.0);
        assert_eq!(report.callbacks, 2);
        assert_eq!(report.frames_rendered, 1024);
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.short_buffers, 1);
        assert!((report.seconds_rendered - 1024.0 / 48000.0).abs() < 1e-9);
        assert_eq!(report.average_frames_per_callback(), 512.0);
    }

    #[test]
    fn test_empty_report() {
        let report = RenderStats::new().report(0.0);
        assert_eq!(report, StatsReport::default());
        assert_eq!(report.average_frames_per_callback(), 0.0);
    }
}
