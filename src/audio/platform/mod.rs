//! 平台音频框架边界
//!
//! 设备层只通过 `AudioPlatform` 调用平台：组件查找、实例创建/释放、
//! 属性设置、传输控制。平台错误一律以原始 `OsStatus` 返回，
//! 由设备层映射成错误种类。

use super::format::AudioStreamBasicDescription;
use super::render::RenderTarget;

#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod mock;

#[cfg(target_os = "macos")]
pub use coreaudio::CoreAudioPlatform;
pub use mock::{MockPlatform, MockStage};

/// 平台状态码（CoreAudio 的 OSStatus）
pub type OsStatus = i32;

pub const NO_ERR: OsStatus = 0;

/// 平台音频框架
///
/// 实现者保证：`stop` 返回后不会再调用已注册的 `RenderTarget`；
/// 即使做不到，`dispose` 返回后也绝不会再调用
pub trait AudioPlatform {
    /// 组件（默认输出端点的描述）
    type Component: Copy;
    /// 输出单元实例
    type Unit;

    /// 查找默认输出组件，没有则返回 None
    fn find_default_output(&self) -> Option<Self::Component>;

    fn new_instance(&self, component: Self::Component) -> Result<Self::Unit, OsStatus>;

    fn initialize(&self, unit: &mut Self::Unit) -> Result<(), OsStatus>;

    /// 设置输入 scope、element 0 的流格式
    fn set_stream_format(
        &self,
        unit: &mut Self::Unit,
        format: &AudioStreamBasicDescription,
    ) -> Result<(), OsStatus>;

    fn set_render_callback(
        &self,
        unit: &mut Self::Unit,
        target: RenderTarget,
    ) -> Result<(), OsStatus>;

    fn start(&self, unit: &mut Self::Unit) -> Result<(), OsStatus>;

    fn stop(&self, unit: &mut Self::Unit) -> Result<(), OsStatus>;

    fn uninitialize(&self, unit: &mut Self::Unit) -> Result<(), OsStatus>;

    fn dispose(&self, unit: Self::Unit) -> Result<(), OsStatus>;
}

/// 把 OSStatus 转成 Result
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
#[inline]
pub(crate) fn check(status: OsStatus) -> Result<(), OsStatus> {
    if status == NO_ERR {
        Ok(())
    } else {
        Err(status)
    }
}
