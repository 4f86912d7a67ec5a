// 编解码引擎：μ-law 压扩、8k/24k 重采样、帧能量（打断检测）
// 全部是无状态的纯函数

pub mod level;
pub mod mulaw;
pub mod resample;

pub use level::rms;
pub use resample::{AI_RATE, TELEPHONY_RATE, resample};
