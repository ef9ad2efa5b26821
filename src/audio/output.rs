//! 默认输出设备
//!
//! 打开系统默认输出端点，协商 32-bit float 交织 PCM，
//! 安装 render callback 并启动/停止播放。
//!
//! 状态机只有 Closed → Open → Closed，没有暂停。

use std::sync::Arc;

use thiserror::Error;

use super::format::StreamFormat;
use super::platform::{AudioPlatform, OsStatus};
use super::render::{ContextHandle, RenderCallback};
use super::stats::{RenderStats, StatsReport};

/// 音频输出错误
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Invalid stream format ({sample_rate}Hz, {channels}ch): {reason}")]
    InvalidFormat {
        sample_rate: f64,
        channels: u32,
        reason: &'static str,
    },
    #[error("Audio device is already open")]
    AlreadyOpen,
    #[error("Failed to open default audio device")]
    DeviceNotFound,
    #[error("Failed to create audio unit instance: OSStatus {0}")]
    InstantiationFailed(OsStatus),
    #[error("Unable to initialize audio unit instance: OSStatus {0}")]
    InitializationFailed(OsStatus),
    #[error("Stream format {sample_rate}Hz / {channels}ch float32 rejected: OSStatus {status}")]
    FormatRejected {
        sample_rate: f64,
        channels: u32,
        status: OsStatus,
    },
    #[error("Unable to attach a render callback to the audio unit: OSStatus {0}")]
    CallbackRegistrationFailed(OsStatus),
    #[error("Unable to start audio unit: OSStatus {0}")]
    StartFailed(OsStatus),
    #[error("Failed to stop audio unit cleanly: OSStatus {0}")]
    StopFailed(OsStatus),
}

/// 错误种类（不带细节，便于匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidFormat,
    AlreadyOpen,
    DeviceNotFound,
    InstantiationFailed,
    InitializationFailed,
    FormatRejected,
    CallbackRegistrationFailed,
    StartFailed,
    StopFailed,
}

impl OutputError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            Self::AlreadyOpen => ErrorKind::AlreadyOpen,
            Self::DeviceNotFound => ErrorKind::DeviceNotFound,
            Self::InstantiationFailed(_) => ErrorKind::InstantiationFailed,
            Self::InitializationFailed(_) => ErrorKind::InitializationFailed,
            Self::FormatRejected { .. } => ErrorKind::FormatRejected,
            Self::CallbackRegistrationFailed(_) => ErrorKind::CallbackRegistrationFailed,
            Self::StartFailed(_) => ErrorKind::StartFailed,
            Self::StopFailed(_) => ErrorKind::StopFailed,
        }
    }

    /// 平台返回的原始状态码（如果有）
    pub fn status(&self) -> Option<OsStatus> {
        match self {
            Self::InstantiationFailed(s)
            | Self::InitializationFailed(s)
            | Self::CallbackRegistrationFailed(s)
            | Self::StartFailed(s)
            | Self::StopFailed(s) => Some(*s),
            Self::FormatRejected { status, .. } => Some(*status),
            Self::InvalidFormat { .. } | Self::AlreadyOpen | Self::DeviceNotFound => None,
        }
    }
}

/// 已获取的平台资源
///
/// open 的每一步都只往这里登记，失败和 close 走同一个 `teardown`
struct Session<U> {
    unit: U,
    format: StreamFormat,
    initialized: bool,
    started: bool,
    /// 必须在 unit dispose 之后才释放
    context: Option<ContextHandle>,
}

impl<U> Session<U> {
    fn new(unit: U, format: StreamFormat) -> Self {
        Self {
            unit,
            format,
            initialized: false,
            started: false,
            context: None,
        }
    }
}

/// 释放 session 持有的所有资源
///
/// 顺序：停止转发 → stop → uninitialize → dispose → 释放回调上下文。
/// 每一步都执行，返回遇到的第一个错误
fn teardown<P: AudioPlatform>(platform: &P, session: Session<P::Unit>) -> Result<(), OsStatus> {
    let Session {
        mut unit,
        initialized,
        started,
        context,
        ..
    } = session;

    let mut first_error: Option<OsStatus> = None;

    if let Some(ref context) = context {
        context.halt();
    }

    if started {
        if let Err(status) = platform.stop(&mut unit) {
            log::warn!("AudioOutputUnitStop failed: OSStatus {}", status);
            first_error.get_or_insert(status);
        }
    }

    if initialized {
        if let Err(status) = platform.uninitialize(&mut unit) {
            log::warn!("AudioUnitUninitialize failed: OSStatus {}", status);
            first_error.get_or_insert(status);
        }
    }

    if let Err(status) = platform.dispose(unit) {
        log::warn!("AudioComponentInstanceDispose failed: OSStatus {}", status);
        first_error.get_or_insert(status);
    }

    // 平台已不再持有 RenderTarget
    drop(context);

    match first_error {
        Some(status) => Err(status),
        None => Ok(()),
    }
}

/// 默认输出设备
///
/// 回调和错误信息都属于这个实例，多个设备可以同时打开，互不干扰
pub struct AudioOutputDevice<P: AudioPlatform> {
    platform: P,
    session: Option<Session<P::Unit>>,
    stats: Arc<RenderStats>,
    /// 统计对应的采样率（close 后保留）
    stats_sample_rate: f64,
    /// 最近一次失败的错误信息（成功的操作不清除）
    last_error: Option<String>,
}

impl<P: AudioPlatform> AudioOutputDevice<P> {
    /// 创建一个处于 Closed 状态的设备
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            session: None,
            stats: Arc::new(RenderStats::new()),
            stats_sample_rate: 0.0,
            last_error: None,
        }
    }

    /// 打开默认输出并开始渲染
    ///
    /// `callback` 在平台实时线程上被调用，参数为
    /// `(frame_count, channel_count, interleaved_buffer)`，
    /// 必须在返回前填满整个 buffer
    pub fn open<F>(&mut self, sample_rate: f64, channels: u32, callback: F) -> Result<(), OutputError>
    where
        F: FnMut(u32, u32, &mut [f32]) + Send + 'static,
    {
        self.open_format(StreamFormat::new(sample_rate, channels), callback)
    }

    /// 以给定格式打开
    pub fn open_format<F>(&mut self, format: StreamFormat, callback: F) -> Result<(), OutputError>
    where
        F: FnMut(u32, u32, &mut [f32]) + Send + 'static,
    {
        let result = self.try_open(format, Box::new(callback));
        if let Err(ref e) = result {
            log::warn!("Failed to open audio output: {}", e);
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn try_open(&mut self, format: StreamFormat, callback: RenderCallback) -> Result<(), OutputError> {
        if self.session.is_some() {
            return Err(OutputError::AlreadyOpen);
        }
        format.validate()?;

        let component = self
            .platform
            .find_default_output()
            .ok_or(OutputError::DeviceNotFound)?;

        let unit = self
            .platform
            .new_instance(component)
            .map_err(OutputError::InstantiationFailed)?;
        log::debug!("Default output unit instantiated");

        let stats = Arc::new(RenderStats::new());
        let mut session = Session::new(unit, format);

        match Self::configure(&self.platform, &mut session, callback, Arc::clone(&stats)) {
            Ok(()) => {
                self.stats = stats;
                self.stats_sample_rate = format.sample_rate;
                self.session = Some(session);
                log::info!(
                    "Audio output started: {}Hz, {} channels, float32 interleaved",
                    format.sample_rate,
                    format.channels
                );
                Ok(())
            }
            Err(e) => {
                if let Err(status) = teardown(&self.platform, session) {
                    log::warn!("Cleanup after failed open reported OSStatus {}", status);
                }
                Err(e)
            }
        }
    }

    /// initialize → 设置格式 → 注册回调 → start
    fn configure(
        platform: &P,
        session: &mut Session<P::Unit>,
        callback: RenderCallback,
        stats: Arc<RenderStats>,
    ) -> Result<(), OutputError> {
        let format = session.format;

        platform
            .initialize(&mut session.unit)
            .map_err(OutputError::InitializationFailed)?;
        session.initialized = true;
        log::debug!("Audio unit initialized");

        platform
            .set_stream_format(&mut session.unit, &format.description())
            .map_err(|status| OutputError::FormatRejected {
                sample_rate: format.sample_rate,
                channels: format.channels,
                status,
            })?;
        log::debug!(
            "Stream format set: {}Hz, {}ch, {} bytes/frame",
            format.sample_rate,
            format.channels,
            format.bytes_per_frame()
        );

        // 上下文先交给 session，注册失败时也由 teardown 释放
        let context = session
            .context
            .insert(ContextHandle::new(callback, format.channels, stats));
        let target = context.target();
        platform
            .set_render_callback(&mut session.unit, target)
            .map_err(OutputError::CallbackRegistrationFailed)?;
        log::debug!("Render callback attached");

        platform
            .start(&mut session.unit)
            .map_err(OutputError::StartFailed)?;
        session.started = true;

        Ok(())
    }

    /// 停止播放并释放设备
    ///
    /// 幂等：对未打开的设备调用直接返回 Ok。
    /// 平台报错时仍会完成全部释放，然后返回 `StopFailed`
    pub fn close(&mut self) -> Result<(), OutputError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        match teardown(&self.platform, session) {
            Ok(()) => {
                log::info!("Audio output stopped");
                Ok(())
            }
            Err(status) => {
                let e = OutputError::StopFailed(status);
                log::warn!("{}", e);
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// 最近一次失败的错误信息
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// 当前协商好的格式
    pub fn format(&self) -> Option<StreamFormat> {
        self.session.as_ref().map(|s| s.format)
    }

    /// 最近一次 open 以来的渲染统计（close 后仍可读取）
    pub fn stats(&self) -> StatsReport {
        self.stats.report(self.stats_sample_rate)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}

#[cfg(target_os = "macos")]
impl AudioOutputDevice<super::platform::CoreAudioPlatform> {
    /// 使用 Core Audio 默认输出
    pub fn system() -> Self {
        Self::new(super::platform::CoreAudioPlatform::new())
    }
}

impl<P: AudioPlatform> Drop for AudioOutputDevice<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Error while closing audio output on drop: {}", e);
        }
    }
}
