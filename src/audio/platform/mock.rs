//! 模拟平台
//!
//! 不依赖音频硬件，用于确定性测试和没有 Core Audio 的主机。
//! 每个 unit 启动后由一个后台线程按固定周期串行调用 render，
//! 并记录所有平台调用的次数。

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{AudioPlatform, OsStatus};
use crate::audio::format::{AudioStreamBasicDescription, StreamFormat};
use crate::audio::render::RenderTarget;

/// paramErr
pub const MOCK_FAILURE_STATUS: OsStatus = -50;
/// kAudioUnitErr_FormatNotSupported
pub const K_AUDIO_UNIT_ERR_FORMAT_NOT_SUPPORTED: OsStatus = -10868;
/// kAudioUnitErr_Uninitialized
pub const K_AUDIO_UNIT_ERR_UNINITIALIZED: OsStatus = -10867;

/// 可注入失败的平台调用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockStage {
    Instantiate,
    Initialize,
    StreamFormat,
    RenderCallback,
    Start,
    Stop,
    Dispose,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    disposed: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    renders: AtomicUsize,
    /// 每个实例最近一次转发后输出的首个样本（f32 bits），按创建顺序
    outputs: Mutex<Vec<Arc<AtomicU32>>>,
}

/// 模拟平台（可 clone，clone 之间共享计数器）
#[derive(Clone, Debug)]
pub struct MockPlatform {
    has_default_device: bool,
    fail_at: Option<MockStage>,
    max_channels: u32,
    sample_rates: RangeInclusive<f64>,
    frames_per_buffer: u32,
    period: Duration,
    late_callback: bool,
    counters: Arc<Counters>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            has_default_device: true,
            fail_at: None,
            max_channels: 32,
            sample_rates: 8000.0..=384000.0,
            frames_per_buffer: 256,
            period: Duration::from_millis(1),
            late_callback: false,
            counters: Arc::new(Counters::default()),
        }
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟没有默认输出设备
    pub fn without_default_device(mut self) -> Self {
        self.has_default_device = false;
        self
    }

    /// 指定调用返回 `MOCK_FAILURE_STATUS`
    pub fn fail_at(mut self, stage: MockStage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub fn max_channels(mut self, channels: u32) -> Self {
        self.max_channels = channels;
        self
    }

    pub fn sample_rate_range(mut self, range: RangeInclusive<f64>) -> Self {
        self.sample_rates = range;
        self
    }

    pub fn frames_per_buffer(mut self, frames: u32) -> Self {
        self.frames_per_buffer = frames.max(1);
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// stop 之后再同步触发一次 render，模拟迟到的硬件回调
    pub fn late_callback_after_stop(mut self) -> Self {
        self.late_callback = true;
        self
    }

    pub fn instances_created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn instances_disposed(&self) -> usize {
        self.counters.disposed.load(Ordering::SeqCst)
    }

    /// 尚未 dispose 的实例数
    pub fn live_instances(&self) -> usize {
        self.instances_created() - self.instances_disposed()
    }

    pub fn start_calls(&self) -> usize {
        self.counters.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.counters.stop_calls.load(Ordering::SeqCst)
    }

    /// 平台发起的 render 总次数（包括被抑制的）
    pub fn renders(&self) -> usize {
        self.counters.renders.load(Ordering::SeqCst)
    }

    /// 第 `instance` 个实例（从 0 开始）最近一次由用户回调写出的首个样本
    pub fn last_output(&self, instance: usize) -> Option<f32> {
        let outputs = self.counters.outputs.lock().unwrap_or_else(|e| e.into_inner());
        outputs
            .get(instance)
            .map(|bits| f32::from_bits(bits.load(Ordering::SeqCst)))
    }

    fn buffer_samples(&self, format: &AudioStreamBasicDescription) -> usize {
        StreamFormat::from(format).samples_for(self.frames_per_buffer)
    }

    fn injected(&self, stage: MockStage) -> Result<(), OsStatus> {
        if self.fail_at == Some(stage) {
            Err(MOCK_FAILURE_STATUS)
        } else {
            Ok(())
        }
    }

    fn accepts(&self, format: &AudioStreamBasicDescription) -> bool {
        format.is_float()
            && !format.is_non_interleaved()
            && format.bits_per_channel == 32
            && format.channels_per_frame >= 1
            && format.channels_per_frame <= self.max_channels
            && self.sample_rates.contains(&format.sample_rate)
    }
}

/// 模拟的默认输出组件
#[derive(Clone, Copy, Debug)]
pub struct MockComponent;

/// 模拟的 unit 实例
#[derive(Debug)]
pub struct MockUnit {
    initialized: bool,
    format: Option<AudioStreamBasicDescription>,
    target: Option<RenderTarget>,
    driver: Option<Driver>,
    output: Arc<AtomicU32>,
}

/// 驱动 render 的后台线程（相当于 IO 线程）
#[derive(Debug)]
struct Driver {
    running: Arc<AtomicBool>,
    // render 期间持有；stop 拿到它就说明没有进行中的回调
    gate: Arc<Mutex<()>>,
    handle: JoinHandle<()>,
}

impl Driver {
    fn spawn(
        target: RenderTarget,
        frames: u32,
        samples: usize,
        period: Duration,
        counters: Arc<Counters>,
        output: Arc<AtomicU32>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let gate = Arc::new(Mutex::new(()));

        let thread_running = Arc::clone(&running);
        let thread_gate = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            let mut buffer = vec![0.0f32; samples];
            loop {
                {
                    let _guard = thread_gate.lock().unwrap_or_else(|e| e.into_inner());
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }
                    // SAFETY: 设备在 dispose 之后才释放上下文，dispose 会先 join 本线程
                    let forwarded = unsafe { target.render(frames, &mut buffer) };
                    counters.renders.fetch_add(1, Ordering::SeqCst);
                    if let (true, Some(&first)) = (forwarded, buffer.first()) {
                        output.store(first.to_bits(), Ordering::SeqCst);
                    }
                }
                thread::sleep(period);
            }
        });

        Self {
            running,
            gate,
            handle,
        }
    }

    fn halt(self) {
        {
            let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            self.running.store(false, Ordering::Release);
        }
        if self.handle.join().is_err() {
            log::warn!("Mock render thread panicked");
        }
    }
}

impl AudioPlatform for MockPlatform {
    type Component = MockComponent;
    type Unit = MockUnit;

    fn find_default_output(&self) -> Option<MockComponent> {
        self.has_default_device.then_some(MockComponent)
    }

    fn new_instance(&self, _component: MockComponent) -> Result<MockUnit, OsStatus> {
        self.injected(MockStage::Instantiate)?;
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let output = Arc::new(AtomicU32::new(0.0f32.to_bits()));
        self.counters
            .outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&output));
        Ok(MockUnit {
            initialized: false,
            format: None,
            target: None,
            driver: None,
            output,
        })
    }

    fn initialize(&self, unit: &mut MockUnit) -> Result<(), OsStatus> {
        self.injected(MockStage::Initialize)?;
        unit.initialized = true;
        Ok(())
    }

    fn set_stream_format(
        &self,
        unit: &mut MockUnit,
        format: &AudioStreamBasicDescription,
    ) -> Result<(), OsStatus> {
        self.injected(MockStage::StreamFormat)?;
        if !self.accepts(format) {
            return Err(K_AUDIO_UNIT_ERR_FORMAT_NOT_SUPPORTED);
        }
        unit.format = Some(*format);
        Ok(())
    }

    fn set_render_callback(&self, unit: &mut MockUnit, target: RenderTarget) -> Result<(), OsStatus> {
        self.injected(MockStage::RenderCallback)?;
        unit.target = Some(target);
        Ok(())
    }

    fn start(&self, unit: &mut MockUnit) -> Result<(), OsStatus> {
        self.counters.start_calls.fetch_add(1, Ordering::SeqCst);
        self.injected(MockStage::Start)?;

        if unit.driver.is_some() {
            return Ok(());
        }
        let (format, target) = match (unit.initialized, unit.format, unit.target) {
            (true, Some(format), Some(target)) => (format, target),
            _ => return Err(K_AUDIO_UNIT_ERR_UNINITIALIZED),
        };

        unit.driver = Some(Driver::spawn(
            target,
            self.frames_per_buffer,
            self.buffer_samples(&format),
            self.period,
            Arc::clone(&self.counters),
            Arc::clone(&unit.output),
        ));
        Ok(())
    }

    fn stop(&self, unit: &mut MockUnit) -> Result<(), OsStatus> {
        self.counters.stop_calls.fetch_add(1, Ordering::SeqCst);
        // 注入的 stop 失败：传输继续运行，直到 dispose
        self.injected(MockStage::Stop)?;

        if let Some(driver) = unit.driver.take() {
            driver.halt();

            if self.late_callback {
                if let (Some(format), Some(target)) = (unit.format, unit.target) {
                    let mut buffer = vec![0.0f32; self.buffer_samples(&format)];
                    // SAFETY: 上下文在 dispose 之前一直存活
                    unsafe { target.render(self.frames_per_buffer, &mut buffer) };
                    self.counters.renders.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    fn uninitialize(&self, unit: &mut MockUnit) -> Result<(), OsStatus> {
        unit.initialized = false;
        Ok(())
    }

    fn dispose(&self, mut unit: MockUnit) -> Result<(), OsStatus> {
        if let Some(driver) = unit.driver.take() {
            driver.halt();
        }
        unit.target = None;
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        self.injected(MockStage::Dispose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::StreamFormat;

    #[test]
    fn test_missing_device() {
        let platform = MockPlatform::new().without_default_device();
        assert!(platform.find_default_output().is_none());
    }

    #[test]
    fn test_format_acceptance() {
        let platform = MockPlatform::new()
            .max_channels(2)
            .sample_rate_range(44100.0..=48000.0);
        let mut unit = platform.new_instance(MockComponent).unwrap();

        let ok = StreamFormat::new(48000.0, 2).description();
        assert!(platform.set_stream_format(&mut unit, &ok).is_ok());

        let too_many = StreamFormat::new(48000.0, 6).description();
        assert_eq!(
            platform.set_stream_format(&mut unit, &too_many),
            Err(K_AUDIO_UNIT_ERR_FORMAT_NOT_SUPPORTED)
        );

        let too_fast = StreamFormat::new(96000.0, 2).description();
        assert_eq!(
            platform.set_stream_format(&mut unit, &too_fast),
            Err(K_AUDIO_UNIT_ERR_FORMAT_NOT_SUPPORTED)
        );

        platform.dispose(unit).unwrap();
        assert_eq!(platform.live_instances(), 0);
    }

    #[test]
    fn test_start_requires_configuration() {
        let platform = MockPlatform::new();
        let mut unit = platform.new_instance(MockComponent).unwrap();

        assert_eq!(platform.start(&mut unit), Err(K_AUDIO_UNIT_ERR_UNINITIALIZED));
        assert_eq!(platform.start_calls(), 1);

        platform.dispose(unit).unwrap();
    }

    #[test]
    fn test_injected_failure() {
        let platform = MockPlatform::new().fail_at(MockStage::Instantiate);
        assert_eq!(
            platform.new_instance(MockComponent).unwrap_err(),
            MOCK_FAILURE_STATUS
        );
        assert_eq!(platform.instances_created(), 0);
        assert_eq!(platform.last_output(0), None);
    }

    #[test]
    fn test_driver_renders_configured_buffer() {
        use crate::audio::render::ContextHandle;
        use crate::audio::stats::RenderStats;

        let platform = MockPlatform::new()
            .frames_per_buffer(64)
            .period(Duration::from_micros(200));
        let stats = Arc::new(RenderStats::new());
        let context = ContextHandle::new(
            Box::new(|frames: u32, channels: u32, buf: &mut [f32]| {
                assert_eq!(buf.len(), frames as usize * channels as usize);
                buf.fill(0.25);
            }),
            3,
            Arc::clone(&stats),
        );

        let mut unit = platform.new_instance(MockComponent).unwrap();
        platform.initialize(&mut unit).unwrap();
        platform
            .set_stream_format(&mut unit, &StreamFormat::new(48000.0, 3).description())
            .unwrap();
        platform.set_render_callback(&mut unit, context.target()).unwrap();
        platform.start(&mut unit).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while platform.renders() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        platform.stop(&mut unit).unwrap();
        platform.dispose(unit).unwrap();

        assert!(platform.renders() >= 3);
        assert_eq!(stats.frames_rendered(), stats.callback_count() * 64);
        assert_eq!(platform.last_output(0), Some(0.25));
        drop(context);
    }
}
