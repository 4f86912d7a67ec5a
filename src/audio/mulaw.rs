// G.711 μ-law：8位电话字节 <-> 16位线性PCM

use std::sync::LazyLock;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// 解码表，首次使用时构建，所有通话共享
static ULAW_TO_LINEAR: LazyLock<[i16; 256]> = LazyLock::new(|| {
    let mut table = [0i16; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        *slot = expand(byte as u8);
    }
    table
});

/// 加偏置后幅度对应的段号，下标为 `magnitude >> 7`
static SEGMENT: LazyLock<[u8; 256]> = LazyLock::new(|| {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate().skip(1) {
        // floor(log2(i)), i.e. the position of the highest set bit
        *slot = (usize::BITS - 1 - i.leading_zeros()) as u8;
    }
    table
});

fn expand(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

#[inline]
pub fn decode_sample(byte: u8) -> i16 {
    ULAW_TO_LINEAR[byte as usize]
}

#[inline]
pub fn encode_sample(pcm: i16) -> u8 {
    let sign: u8 = if pcm < 0 { 0x80 } else { 0x00 };
    let magnitude = (pcm as i32).abs().min(CLIP) + BIAS;

    let exponent = SEGMENT[((magnitude >> 7) & 0xFF) as usize];
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// μ-law 字节解码为线性 PCM
pub fn decode(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_sample(b)).collect()
}

/// 线性 PCM 编码为 μ-law 字节
pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}
