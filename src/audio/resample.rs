// 电话侧 8kHz 与 AI 侧 24kHz 之间的采样率转换
// 两个固定比例走专用路径，其余走线性插值，所有运算向下取整

use std::borrow::Cow;

pub const TELEPHONY_RATE: u32 = 8000;
pub const AI_RATE: u32 = 24000;

/// 把 `samples` 从 `from_rate` 转换到 `to_rate`
/// 采样率相同时直接返回输入切片，任一采样率为 0 时返回空帧
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Cow<'_, [i16]> {
    if from_rate == 0 || to_rate == 0 {
        return Cow::Owned(Vec::new());
    }
    if from_rate == to_rate || samples.is_empty() {
        return Cow::Borrowed(samples);
    }
    match (from_rate, to_rate) {
        (TELEPHONY_RATE, AI_RATE) => Cow::Owned(upsample_x3(samples)),
        (AI_RATE, TELEPHONY_RATE) => Cow::Owned(downsample_x3(samples)),
        _ => Cow::Owned(linear(samples, from_rate, to_rate)),
    }
}

/// 8 kHz → 24 kHz：每对 (s1, s2) 输出 s1 以及 1/3、2/3 处的插值点
/// 最后一个采样重复三次
fn upsample_x3(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 3);
    for pair in samples.windows(2) {
        let (s1, s2) = (pair[0] as i32, pair[1] as i32);
        out.push(pair[0]);
        out.push((2 * s1 + s2).div_euclid(3) as i16);
        out.push((s1 + 2 * s2).div_euclid(3) as i16);
    }
    if let Some(&last) = samples.last() {
        out.extend([last; 3]);
    }
    out
}

/// 24 kHz → 8 kHz：每三个采样取平均，末尾不足三个的丢弃
fn downsample_x3(samples: &[i16]) -> Vec<i16> {
    samples
        .chunks_exact(3)
        .map(|t| (t[0] as i32 + t[1] as i32 + t[2] as i32).div_euclid(3) as i16)
        .collect()
}

fn linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let lo = (pos.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            let frac = pos - lo as f64;
            let a = samples[lo] as f64;
            let b = samples[hi] as f64;
            (a + (b - a) * frac).floor() as i16
        })
        .collect()
}

/// 小端 16 位 PCM 字节转采样，末尾多出的奇数字节忽略
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
