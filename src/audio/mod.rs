//! 音频输出模块
//!
//! 包含：
//! - Format: 流格式和 ASBD
//! - Render: 回调上下文与 trampoline
//! - Stats: 渲染统计
//! - Platform: 平台边界（Core Audio / Mock）
//! - Output: 默认输出设备

pub mod format;
pub mod output;
pub mod platform;
pub mod render;
pub mod stats;

pub use format::{AudioStreamBasicDescription, StreamFormat};
pub use output::{AudioOutputDevice, ErrorKind, OutputError};
pub use platform::{AudioPlatform, MockPlatform, MockStage, OsStatus};
pub use render::{RenderCallback, RenderTarget};
pub use stats::{RenderStats, StatsReport};

#[cfg(target_os = "macos")]
pub use platform::CoreAudioPlatform;
