//! Core Audio DefaultOutput 绑定
//!
//! 使用 kAudioUnitSubType_DefaultOutput（经过系统混音器），
//! 跟随系统默认输出设备

use std::ffi::c_void;
use std::ptr;

use super::{check, AudioPlatform, OsStatus, NO_ERR};
use crate::audio::format::AudioStreamBasicDescription;
use crate::audio::render::RenderTarget;

type AudioUnit = *mut c_void;
type AudioComponentInstance = AudioUnit;
type AudioComponent = *mut c_void;

const K_AUDIO_UNIT_SCOPE_INPUT: u32 = 1;

const K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT: u32 = 8;
const K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK: u32 = 23;

const K_AUDIO_UNIT_RENDER_ACTION_OUTPUT_IS_SILENCE: u32 = 1 << 4;

const K_AUDIO_UNIT_TYPE_OUTPUT: u32 = 0x61756F75; // 'auou'
const K_AUDIO_UNIT_SUB_TYPE_DEFAULT_OUTPUT: u32 = 0x64656620; // 'def '
const K_AUDIO_UNIT_MANUFACTURER_APPLE: u32 = 0x6170706C; // 'appl'

#[repr(C)]
struct AudioComponentDescription {
    component_type: u32,
    component_sub_type: u32,
    component_manufacturer: u32,
    component_flags: u32,
    component_flags_mask: u32,
}

#[repr(C)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut c_void,
}

/// 交织格式只有一个 buffer
#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 1],
}

type AURenderCallback = extern "C" fn(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    in_time_stamp: *const c_void, // AudioTimeStamp，不读取
    in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OsStatus;

#[repr(C)]
struct AURenderCallbackStruct {
    input_proc: AURenderCallback,
    input_proc_ref_con: *mut c_void,
}

#[link(name = "AudioToolbox", kind = "framework")]
extern "C" {
    fn AudioComponentFindNext(
        component: AudioComponent,
        desc: *const AudioComponentDescription,
    ) -> AudioComponent;

    fn AudioComponentInstanceNew(
        component: AudioComponent,
        out_instance: *mut AudioComponentInstance,
    ) -> OsStatus;

    fn AudioComponentInstanceDispose(instance: AudioComponentInstance) -> OsStatus;

    fn AudioUnitInitialize(unit: AudioUnit) -> OsStatus;
    fn AudioUnitUninitialize(unit: AudioUnit) -> OsStatus;
    fn AudioOutputUnitStart(unit: AudioUnit) -> OsStatus;
    fn AudioOutputUnitStop(unit: AudioUnit) -> OsStatus;

    fn AudioUnitSetProperty(
        unit: AudioUnit,
        property_id: u32,
        scope: u32,
        element: u32,
        data: *const c_void,
        data_size: u32,
    ) -> OsStatus;
}

/// 已找到的 DefaultOutput 组件
#[derive(Clone, Copy, Debug)]
pub struct CoreAudioComponent(AudioComponent);

/// AudioUnit 实例
///
/// 只在持有它的设备线程上做属性设置和启停；
/// 回调线程只碰 ref-con 指向的上下文
#[derive(Debug)]
pub struct CoreAudioUnit(AudioUnit);

unsafe impl Send for CoreAudioUnit {}

/// Core Audio 平台
#[derive(Clone, Copy, Debug, Default)]
pub struct CoreAudioPlatform;

impl CoreAudioPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl AudioPlatform for CoreAudioPlatform {
    type Component = CoreAudioComponent;
    type Unit = CoreAudioUnit;

    fn find_default_output(&self) -> Option<CoreAudioComponent> {
        let desc = AudioComponentDescription {
            component_type: K_AUDIO_UNIT_TYPE_OUTPUT,
            component_sub_type: K_AUDIO_UNIT_SUB_TYPE_DEFAULT_OUTPUT,
            component_manufacturer: K_AUDIO_UNIT_MANUFACTURER_APPLE,
            component_flags: 0,
            component_flags_mask: 0,
        };

        let component = unsafe { AudioComponentFindNext(ptr::null_mut(), &desc) };
        if component.is_null() {
            None
        } else {
            Some(CoreAudioComponent(component))
        }
    }

    fn new_instance(&self, component: CoreAudioComponent) -> Result<CoreAudioUnit, OsStatus> {
        let mut audio_unit: AudioUnit = ptr::null_mut();
        check(unsafe { AudioComponentInstanceNew(component.0, &mut audio_unit) })?;
        Ok(CoreAudioUnit(audio_unit))
    }

    fn initialize(&self, unit: &mut CoreAudioUnit) -> Result<(), OsStatus> {
        check(unsafe { AudioUnitInitialize(unit.0) })
    }

    fn set_stream_format(
        &self,
        unit: &mut CoreAudioUnit,
        format: &AudioStreamBasicDescription,
    ) -> Result<(), OsStatus> {
        check(unsafe {
            AudioUnitSetProperty(
                unit.0,
                K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT,
                K_AUDIO_UNIT_SCOPE_INPUT,
                0,
                format as *const _ as *const c_void,
                std::mem::size_of::<AudioStreamBasicDescription>() as u32,
            )
        })
    }

    fn set_render_callback(
        &self,
        unit: &mut CoreAudioUnit,
        target: RenderTarget,
    ) -> Result<(), OsStatus> {
        // 属性值是结构体本身，按引用传递并给出结构体大小
        let callback_struct = AURenderCallbackStruct {
            input_proc: render_callback,
            input_proc_ref_con: target.as_ptr(),
        };

        check(unsafe {
            AudioUnitSetProperty(
                unit.0,
                K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK,
                K_AUDIO_UNIT_SCOPE_INPUT,
                0,
                &callback_struct as *const _ as *const c_void,
                std::mem::size_of::<AURenderCallbackStruct>() as u32,
            )
        })
    }

    fn start(&self, unit: &mut CoreAudioUnit) -> Result<(), OsStatus> {
        check(unsafe { AudioOutputUnitStart(unit.0) })
    }

    fn stop(&self, unit: &mut CoreAudioUnit) -> Result<(), OsStatus> {
        // AudioOutputUnitStop 在 IO 线程退出当前回调后才返回
        check(unsafe { AudioOutputUnitStop(unit.0) })
    }

    fn uninitialize(&self, unit: &mut CoreAudioUnit) -> Result<(), OsStatus> {
        check(unsafe { AudioUnitUninitialize(unit.0) })
    }

    fn dispose(&self, unit: CoreAudioUnit) -> Result<(), OsStatus> {
        if unit.0.is_null() {
            return Ok(());
        }
        check(unsafe { AudioComponentInstanceDispose(unit.0) })
    }
}

/// Render Callback (AudioUnit)
///
/// **绝对禁止：**
/// - 锁
/// - 分配
/// - I/O
/// - println!
extern "C" fn render_callback(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    _in_time_stamp: *const c_void, // AudioTimeStamp，不读取
    _in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OsStatus {
    let target = match unsafe { RenderTarget::from_ptr(in_ref_con) } {
        Some(target) => target,
        None => return NO_ERR,
    };

    if io_data.is_null() {
        return NO_ERR;
    }
    let buffer_list = unsafe { &mut *io_data };
    if buffer_list.number_buffers == 0 || buffer_list.buffers[0].data.is_null() {
        return NO_ERR;
    }

    let buffer = &mut buffer_list.buffers[0];
    let samples = buffer.data_byte_size as usize / std::mem::size_of::<f32>();
    let output = unsafe { std::slice::from_raw_parts_mut(buffer.data as *mut f32, samples) };

    let forwarded = unsafe { target.render(in_number_frames, output) };
    if !forwarded && !io_action_flags.is_null() {
        // 整个 buffer 都是零，告诉平台可以跳过后续处理
        unsafe { *io_action_flags |= K_AUDIO_UNIT_RENDER_ACTION_OUTPUT_IS_SILENCE };
    }

    NO_ERR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::render::ContextHandle;
    use crate::audio::stats::RenderStats;
    use crate::audio::AudioOutputDevice;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// 直接调用 C 回调，返回 (action flags, 输出)
    fn call_trampoline(context: &ContextHandle, frames: u32) -> (u32, Vec<f32>) {
        let mut samples = vec![1.0f32; frames as usize * 2];
        let mut list = AudioBufferList {
            number_buffers: 1,
            buffers: [AudioBuffer {
                number_channels: 2,
                data_byte_size: (samples.len() * std::mem::size_of::<f32>()) as u32,
                data: samples.as_mut_ptr().cast(),
            }],
        };
        let mut flags = 0u32;
        let status = render_callback(
            context.target().as_ptr(),
            &mut flags,
            ptr::null(),
            0,
            frames,
            &mut list,
        );
        assert_eq!(status, NO_ERR);
        (flags, samples)
    }

    #[test]
    fn test_halted_callback_reports_silence() {
        let stats = Arc::new(RenderStats::new());
        let context = ContextHandle::new(
            Box::new(|_: u32, _: u32, buf: &mut [f32]| buf.fill(0.5)),
            2,
            Arc::clone(&stats),
        );

        let (flags, samples) = call_trampoline(&context, 16);
        assert_eq!(flags & K_AUDIO_UNIT_RENDER_ACTION_OUTPUT_IS_SILENCE, 0);
        assert!(samples.iter().all(|&s| s == 0.5));

        context.halt();
        let (flags, samples) = call_trampoline(&context, 16);
        assert_ne!(flags & K_AUDIO_UNIT_RENDER_ACTION_OUTPUT_IS_SILENCE, 0);
        assert!(samples.iter().all(|&s| s == 0.0));
        assert_eq!(stats.suppressed_count(), 1);
    }

    #[test]
    #[ignore] // 需要音频设备
    fn test_default_output_renders() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_cb = Arc::clone(&calls);

        let mut device = AudioOutputDevice::new(CoreAudioPlatform::new());
        device
            .open(48000.0, 2, move |_frames, _channels, buffer| {
                buffer.fill(0.0);
                calls_cb.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(200));
        device.close().unwrap();

        let seen = calls.load(Ordering::Relaxed);
        println!("Callbacks: {}", seen);
        assert!(seen > 0);

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::Relaxed), seen);
    }
}
