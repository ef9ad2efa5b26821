//! 流格式协商
//!
//! 输出格式固定为 32-bit float、packed、交织（LRLRLR...）。
//! 只有采样率和声道数由调用者决定。

use super::output::OutputError;

pub const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
pub const K_AUDIO_FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
pub const K_AUDIO_FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;
pub const K_AUDIO_FORMAT_FLAG_IS_NON_INTERLEAVED: u32 = 1 << 5;

/// 每个样本的字节数（f32）
const BYTES_PER_SAMPLE: u32 = std::mem::size_of::<f32>() as u32;

/// AudioStreamBasicDescription
///
/// 与 CoreAudio 的 C 结构体布局一致，可以直接传给 AudioUnitSetProperty
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioStreamBasicDescription {
    pub sample_rate: f64,
    pub format_id: u32,
    pub format_flags: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
    pub reserved: u32,
}

impl AudioStreamBasicDescription {
    pub fn is_float(&self) -> bool {
        (self.format_flags & K_AUDIO_FORMAT_FLAG_IS_FLOAT) != 0
    }

    pub fn is_non_interleaved(&self) -> bool {
        (self.format_flags & K_AUDIO_FORMAT_FLAG_IS_NON_INTERLEAVED) != 0
    }
}

/// 流格式
///
/// 协商成功后不可变；要换格式必须 close 后重新 open
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub channels: u32,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            channels: 2,
        }
    }
}

impl StreamFormat {
    pub fn new(sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 在接触任何平台资源之前检查参数
    pub fn validate(&self) -> Result<(), OutputError> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(OutputError::InvalidFormat {
                sample_rate: self.sample_rate,
                channels: self.channels,
                reason: "sample rate must be a positive finite number",
            });
        }
        if self.channels == 0 {
            return Err(OutputError::InvalidFormat {
                sample_rate: self.sample_rate,
                channels: self.channels,
                reason: "channel count must be at least 1",
            });
        }
        if self.channels.checked_mul(BYTES_PER_SAMPLE).is_none() {
            return Err(OutputError::InvalidFormat {
                sample_rate: self.sample_rate,
                channels: self.channels,
                reason: "channel count too large for a 32-bit frame size",
            });
        }
        Ok(())
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> u32 {
        self.channels * BYTES_PER_SAMPLE
    }

    /// `frames` 帧对应的交织样本数
    #[inline]
    pub fn samples_for(&self, frames: u32) -> usize {
        frames as usize * self.channels as usize
    }

    /// 生成要交给平台的 ASBD
    ///
    /// 调用前必须先 `validate()`
    pub fn description(&self) -> AudioStreamBasicDescription {
        AudioStreamBasicDescription {
            sample_rate: self.sample_rate,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags: K_AUDIO_FORMAT_FLAG_IS_FLOAT | K_AUDIO_FORMAT_FLAG_IS_PACKED,
            bytes_per_packet: self.bytes_per_frame(),
            frames_per_packet: 1,
            bytes_per_frame: self.bytes_per_frame(),
            channels_per_frame: self.channels,
            bits_per_channel: 8 * BYTES_PER_SAMPLE,
            reserved: 0,
        }
    }
}

impl From<&AudioStreamBasicDescription> for StreamFormat {
    fn from(asbd: &AudioStreamBasicDescription) -> Self {
        Self {
            sample_rate: asbd.sample_rate,
            channels: asbd.channels_per_frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::ErrorKind;

    #[test]
    fn test_stereo_description() {
        let asbd = StreamFormat::new(44100.0, 2).description();

        assert_eq!(asbd.sample_rate, 44100.0);
        assert_eq!(asbd.format_id, K_AUDIO_FORMAT_LINEAR_PCM);
        assert!(asbd.is_float());
        assert!(!asbd.is_non_interleaved());
        assert_eq!(asbd.bytes_per_frame, 8);
        assert_eq!(asbd.bytes_per_packet, 8);
        assert_eq!(asbd.frames_per_packet, 1);
        assert_eq!(asbd.bits_per_channel, 32);
        assert_eq!(StreamFormat::from(&asbd), StreamFormat::new(44100.0, 2));
    }

    #[test]
    fn test_samples_for() {
        let format = StreamFormat::new(48000.0, 6);
        assert_eq!(format.samples_for(512), 3072);
        assert_eq!(format.samples_for(0), 0);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let bad = [
            StreamFormat::new(0.0, 2),
            StreamFormat::new(-44100.0, 2),
            StreamFormat::new(f64::NAN, 2),
            StreamFormat::new(f64::INFINITY, 2),
            StreamFormat::new(48000.0, 0),
            StreamFormat::new(48000.0, u32::MAX),
        ];

        for format in bad {
            let err = format.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFormat, "{:?}", format);
        }
    }

    #[test]
    fn test_validate_accepts_default() {
        assert!(StreamFormat::default().validate().is_ok());
        assert!(StreamFormat::new(8000.0, 1).validate().is_ok());
    }
}
