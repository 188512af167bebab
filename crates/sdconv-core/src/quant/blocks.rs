//! 32-element block formats: Q4_0, Q4_1, Q5_0, Q5_1, Q8_0.
//!
//! Every block starts with an f16 scale `d`; the `_1` variants add an f16
//! minimum `m`. Q5 formats keep the fifth bit of each quant in a 32-bit `qh`.
//! Callers guarantee input lengths are whole blocks.

use half::f16;

pub const QK: usize = 32;

fn put_f16(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&f16::from_f32(value).to_le_bytes());
}

fn get_f16(bytes: &[u8]) -> f32 {
    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

/// Value with the largest magnitude, sign preserved.
fn signed_absmax(block: &[f32]) -> f32 {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in block {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }
    max
}

fn min_max(block: &[f32]) -> (f32, f32) {
    block
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn inverse(d: f32) -> f32 {
    if d != 0.0 {
        1.0 / d
    } else {
        0.0
    }
}

pub fn quantize_q4_0(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK) {
        let d = signed_absmax(block) / -8.0;
        let id = inverse(d);
        put_f16(out, d);
        for j in 0..QK / 2 {
            let x0 = ((block[j] * id + 8.5) as i32).clamp(0, 15) as u8;
            let x1 = ((block[j + QK / 2] * id + 8.5) as i32).clamp(0, 15) as u8;
            out.push(x0 | (x1 << 4));
        }
    }
}

pub fn dequantize_q4_0(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(18) {
        let d = get_f16(block);
        let qs = &block[2..];
        out.extend(qs.iter().map(|&q| ((q & 0x0F) as i32 - 8) as f32 * d));
        out.extend(qs.iter().map(|&q| ((q >> 4) as i32 - 8) as f32 * d));
    }
}

pub fn quantize_q4_1(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK) {
        let (min, max) = min_max(block);
        let d = (max - min) / 15.0;
        let id = inverse(d);
        put_f16(out, d);
        put_f16(out, min);
        for j in 0..QK / 2 {
            let x0 = (((block[j] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
            let x1 = (((block[j + QK / 2] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
            out.push(x0 | (x1 << 4));
        }
    }
}

pub fn dequantize_q4_1(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(20) {
        let d = get_f16(block);
        let m = get_f16(&block[2..]);
        let qs = &block[4..];
        out.extend(qs.iter().map(|&q| (q & 0x0F) as f32 * d + m));
        out.extend(qs.iter().map(|&q| (q >> 4) as f32 * d + m));
    }
}

/// Low nibbles into `qs`, fifth bits into `qh` (element j at bit j).
fn pack_q5(quants: &[u8; QK], out: &mut Vec<u8>) {
    let mut qh = 0u32;
    for (j, &q) in quants.iter().enumerate() {
        qh |= (((q & 0x10) >> 4) as u32) << j;
    }
    out.extend_from_slice(&qh.to_le_bytes());
    for j in 0..QK / 2 {
        out.push((quants[j] & 0x0F) | ((quants[j + QK / 2] & 0x0F) << 4));
    }
}

fn unpack_q5(qh_bytes: &[u8], qs: &[u8]) -> [u8; QK] {
    let qh = u32::from_le_bytes([qh_bytes[0], qh_bytes[1], qh_bytes[2], qh_bytes[3]]);
    let mut quants = [0u8; QK];
    for j in 0..QK / 2 {
        let xh0 = (((qh >> j) << 4) & 0x10) as u8;
        let xh1 = ((qh >> (j + 12)) & 0x10) as u8;
        quants[j] = (qs[j] & 0x0F) | xh0;
        quants[j + QK / 2] = (qs[j] >> 4) | xh1;
    }
    quants
}

pub fn quantize_q5_0(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK) {
        let d = signed_absmax(block) / -16.0;
        let id = inverse(d);
        put_f16(out, d);
        let mut quants = [0u8; QK];
        for (q, &x) in quants.iter_mut().zip(block) {
            *q = ((x * id + 16.5) as i32).clamp(0, 31) as u8;
        }
        pack_q5(&quants, out);
    }
}

pub fn dequantize_q5_0(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(22) {
        let d = get_f16(block);
        let quants = unpack_q5(&block[2..6], &block[6..]);
        out.extend(quants.iter().map(|&q| (q as i32 - 16) as f32 * d));
    }
}

pub fn quantize_q5_1(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK) {
        let (min, max) = min_max(block);
        let d = (max - min) / 31.0;
        let id = inverse(d);
        put_f16(out, d);
        put_f16(out, min);
        let mut quants = [0u8; QK];
        for (q, &x) in quants.iter_mut().zip(block) {
            *q = (((x - min) * id + 0.5) as i32).clamp(0, 31) as u8;
        }
        pack_q5(&quants, out);
    }
}

pub fn dequantize_q5_1(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(24) {
        let d = get_f16(block);
        let m = get_f16(&block[2..]);
        let quants = unpack_q5(&block[4..8], &block[8..]);
        out.extend(quants.iter().map(|&q| q as f32 * d + m));
    }
}

pub fn quantize_q8_0(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK) {
        let amax = block.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let d = amax / 127.0;
        let id = inverse(d);
        put_f16(out, d);
        out.extend(block.iter().map(|&x| ((x * id).round() as i32).clamp(-127, 127) as i8 as u8));
    }
}

pub fn dequantize_q8_0(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(34) {
        let d = get_f16(block);
        out.extend(block[2..].iter().map(|&q| (q as i8) as f32 * d));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.37).sin() * 0.9 + 0.05).collect()
    }

    fn max_error(a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    fn check(
        quantize: fn(&[f32], &mut Vec<u8>),
        dequantize: fn(&[u8], &mut Vec<f32>),
        block_bytes: usize,
        tolerance: f32,
    ) {
        let input = sample(128);
        let mut packed = Vec::new();
        quantize(&input, &mut packed);
        assert_eq!(packed.len(), 4 * block_bytes);

        let mut restored = Vec::new();
        dequantize(&packed, &mut restored);
        let err = max_error(&input, &restored);
        assert!(err <= tolerance, "max error {err} above {tolerance}");
    }

    #[test]
    fn test_q4_0_within_tolerance() {
        check(quantize_q4_0, dequantize_q4_0, 18, 0.15);
    }

    #[test]
    fn test_q4_1_within_tolerance() {
        check(quantize_q4_1, dequantize_q4_1, 20, 0.1);
    }

    #[test]
    fn test_q5_0_within_tolerance() {
        check(quantize_q5_0, dequantize_q5_0, 22, 0.08);
    }

    #[test]
    fn test_q5_1_within_tolerance() {
        check(quantize_q5_1, dequantize_q5_1, 24, 0.05);
    }

    #[test]
    fn test_q8_0_within_tolerance() {
        check(quantize_q8_0, dequantize_q8_0, 34, 0.01);
    }

    #[test]
    fn test_zero_block_decodes_to_zero() {
        let zeros = vec![0.0f32; QK];
        let mut packed = Vec::new();
        quantize_q4_0(&zeros, &mut packed);
        let mut restored = Vec::new();
        dequantize_q4_0(&packed, &mut restored);
        assert!(restored.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_q5_high_bits_roundtrip() {
        let mut quants = [0u8; QK];
        for (i, q) in quants.iter_mut().enumerate() {
            *q = (i as u8 * 7) % 32;
        }
        let mut packed = Vec::new();
        pack_q5(&quants, &mut packed);
        assert_eq!(unpack_q5(&packed[..4], &packed[4..]), quants);
    }
}
