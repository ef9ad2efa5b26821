//! coreaudio-shim - 默认输出设备测试音
//!
//! 打开默认输出，播放正弦波或白噪声，结束时打印渲染统计。

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use coreaudio_shim::audio::{AudioOutputDevice, AudioPlatform, MockPlatform, StreamFormat};

/// 测试信号波形
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Wave {
    Sine,
    Noise,
}

/// Play a test tone through the default audio output
#[derive(Parser)]
#[command(name = "coreaudio-shim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Stream sample rate in Hz
    #[arg(short = 'r', long, default_value = "48000")]
    sample_rate: f64,

    /// Number of interleaved channels
    #[arg(short, long, default_value = "2")]
    channels: u32,

    /// Tone frequency in Hz (sine only)
    #[arg(short, long, default_value = "440")]
    frequency: f64,

    /// Peak amplitude (0.0 - 1.0)
    #[arg(short, long, default_value = "0.2")]
    amplitude: f32,

    /// Test signal
    #[arg(short, long, value_enum, default_value = "sine")]
    wave: Wave,

    /// Playback duration in seconds (0 = until Ctrl+C)
    #[arg(short, long, default_value = "3")]
    seconds: f64,

    /// Use the simulated platform instead of Core Audio
    #[arg(long)]
    mock: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// 测试信号发生器
///
/// 在回调线程上运行：构造时完成所有分配和随机数种子初始化
struct ToneGenerator {
    wave: Wave,
    amplitude: f32,
    phase: f64,
    step: f64,
    rng: StdRng,
}

impl ToneGenerator {
    fn new(wave: Wave, frequency: f64, amplitude: f32, sample_rate: f64) -> Self {
        Self {
            wave,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
            step: TAU * frequency / sample_rate,
            rng: StdRng::from_entropy(),
        }
    }

    /// 填充一个交织 buffer，所有声道输出同一信号
    fn fill(&mut self, channels: u32, buffer: &mut [f32]) {
        for frame in buffer.chunks_exact_mut(channels as usize) {
            let sample = match self.wave {
                Wave::Sine => {
                    let s = self.phase.sin() as f32;
                    self.phase = (self.phase + self.step) % TAU;
                    s
                }
                Wave::Noise => self.rng.gen_range(-1.0f32..=1.0),
            } * self.amplitude;
            frame.fill(sample);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    #[cfg(target_os = "macos")]
    {
        if !cli.mock {
            return play(AudioOutputDevice::system(), &cli);
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        if !cli.mock {
            log::warn!("Core Audio is only available on macOS, using simulated output");
        }
    }

    play(AudioOutputDevice::new(MockPlatform::new()), &cli)
}

/// 播放直到时长结束或 Ctrl+C
fn play<P: AudioPlatform>(mut device: AudioOutputDevice<P>, cli: &Cli) -> anyhow::Result<()> {
    let format = StreamFormat::new(cli.sample_rate, cli.channels);
    let mut generator = ToneGenerator::new(cli.wave, cli.frequency, cli.amplitude, cli.sample_rate);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    device.open_format(format, move |_frames, channels, buffer| {
        generator.fill(channels, buffer);
    })?;

    println!(
        "Playing {:?} at {}Hz, {} channels. Press Ctrl+C to stop.",
        cli.wave, cli.sample_rate, cli.channels
    );

    let started = Instant::now();
    let limit = (cli.seconds > 0.0).then(|| Duration::from_secs_f64(cli.seconds));
    while running.load(Ordering::SeqCst) {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    device.close()?;

    println!("\n{}", device.stats());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_channels_match() {
        let mut generator = ToneGenerator::new(Wave::Sine, 1000.0, 0.5, 48000.0);
        let mut buffer = vec![0.0f32; 64 * 2];
        generator.fill(2, &mut buffer);

        for frame in buffer.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert!(frame[0].abs() <= 0.5);
        }
        assert!(buffer.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_noise_within_amplitude() {
        let mut generator = ToneGenerator::new(Wave::Noise, 0.0, 0.1, 44100.0);
        let mut buffer = vec![0.0f32; 256];
        generator.fill(1, &mut buffer);

        assert!(buffer.iter().all(|s| s.abs() <= 0.1));
    }
}
