//! CoreAudio Shim Library
//!
//! 打开系统默认输出设备，以 32-bit float 交织 PCM 驱动调用者提供的实时回调。

pub mod audio;

pub use audio::{AudioOutputDevice, ErrorKind, OutputError, StreamFormat};
