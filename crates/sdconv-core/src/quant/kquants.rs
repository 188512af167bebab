//! 256-element super-block formats: Q2_K, Q3_K, Q4_K.
//!
//! A super-block splits into sub-blocks that each get their own scale (and,
//! for Q2_K and Q4_K, a minimum). Sub-block scales are themselves quantized
//! against the f16 super-block scales `d` and `dmin`.

use half::f16;

pub const QK_K: usize = 256;

const Q2_K_BYTES: usize = 84;
const Q3_K_BYTES: usize = 110;
const Q4_K_BYTES: usize = 144;

fn put_f16(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&f16::from_f32(value).to_le_bytes());
}

fn get_f16(bytes: &[u8]) -> f32 {
    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

fn nearest(x: f32) -> i32 {
    x.round() as i32
}

/// Asymmetric sub-block fit: `x ~ scale * q - min` with `min >= 0`.
///
/// Returns `(scale, min)` for quants in `0..=levels`.
fn fit_scale_min(block: &[f32], levels: f32) -> (f32, f32) {
    let (lo, hi) = block
        .iter()
        .fold((0.0f32, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let hi = hi.max(lo);
    ((hi - lo) / levels, -lo)
}

/// Pack 2-bit quants: 32 bytes per 128 elements, four planes per byte.
fn pack_2bit(quants: &[u8; QK_K], out: &mut Vec<u8>) {
    for chunk in quants.chunks_exact(128) {
        for l in 0..32 {
            out.push(chunk[l] | (chunk[l + 32] << 2) | (chunk[l + 64] << 4) | (chunk[l + 96] << 6));
        }
    }
}

fn unpack_2bit(qs: &[u8], e: usize) -> u8 {
    (qs[(e / 128) * 32 + e % 32] >> (2 * ((e % 128) / 32))) & 3
}

pub fn quantize_q2_k(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK_K) {
        let mut scales = [0.0f32; 16];
        let mut mins = [0.0f32; 16];
        for (j, sub) in block.chunks_exact(16).enumerate() {
            (scales[j], mins[j]) = fit_scale_min(sub, 3.0);
        }
        let max_scale = scales.iter().copied().fold(0.0, f32::max);
        let max_min = mins.iter().copied().fold(0.0, f32::max);

        let mut packed_scales = [0u8; 16];
        let mut d = 0.0;
        if max_scale > 0.0 {
            let iscale = 15.0 / max_scale;
            for (p, &s) in packed_scales.iter_mut().zip(&scales) {
                *p = nearest(iscale * s).clamp(0, 15) as u8;
            }
            d = max_scale / 15.0;
        }
        let mut dmin = 0.0;
        if max_min > 0.0 {
            let iscale = 15.0 / max_min;
            for (p, &m) in packed_scales.iter_mut().zip(&mins) {
                *p |= (nearest(iscale * m).clamp(0, 15) as u8) << 4;
            }
            dmin = max_min / 15.0;
        }
        // Round-trip through f16 so quants match what the decoder sees
        let d = f16::from_f32(d).to_f32();
        let dmin = f16::from_f32(dmin).to_f32();

        let mut quants = [0u8; QK_K];
        for (j, sub) in block.chunks_exact(16).enumerate() {
            let dj = d * (packed_scales[j] & 0x0F) as f32;
            if dj == 0.0 {
                continue;
            }
            let dm = dmin * (packed_scales[j] >> 4) as f32;
            for (i, &x) in sub.iter().enumerate() {
                quants[16 * j + i] = nearest((x + dm) / dj).clamp(0, 3) as u8;
            }
        }

        out.extend_from_slice(&packed_scales);
        pack_2bit(&quants, out);
        put_f16(out, d);
        put_f16(out, dmin);
    }
}

pub fn dequantize_q2_k(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(Q2_K_BYTES) {
        let scales = &block[..16];
        let qs = &block[16..80];
        let d = get_f16(&block[80..]);
        let dmin = get_f16(&block[82..]);
        for e in 0..QK_K {
            let sc = scales[e / 16];
            let q = unpack_2bit(qs, e) as f32;
            out.push(d * (sc & 0x0F) as f32 * q - dmin * (sc >> 4) as f32);
        }
    }
}

/// Pack sixteen 6-bit Q3_K scales (already offset by 32) into 12 bytes.
fn pack_q3_scales(levels: &[u8; 16]) -> [u8; 12] {
    let mut scales = [0u8; 12];
    for (j, &l) in levels.iter().enumerate() {
        if j < 8 {
            scales[j] = l & 0x0F;
        } else {
            scales[j - 8] |= (l & 0x0F) << 4;
        }
        scales[8 + j % 4] |= (l >> 4) << (2 * (j / 4));
    }
    scales
}

fn unpack_q3_scale(scales: &[u8], j: usize) -> i32 {
    let low = if j < 8 {
        scales[j] & 0x0F
    } else {
        scales[j - 8] >> 4
    };
    let high = (scales[8 + j % 4] >> (2 * (j / 4))) & 3;
    (low | (high << 4)) as i32 - 32
}

pub fn quantize_q3_k(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK_K) {
        // Symmetric fit: the largest magnitude maps to -4
        let mut scales = [0.0f32; 16];
        for (j, sub) in block.chunks_exact(16).enumerate() {
            let mut amax = 0.0f32;
            let mut max = 0.0f32;
            for &v in sub {
                if v.abs() > amax {
                    amax = v.abs();
                    max = v;
                }
            }
            scales[j] = if amax > 0.0 { max / -4.0 } else { 0.0 };
        }
        let max_scale = scales
            .iter()
            .copied()
            .fold(0.0f32, |acc, s| if s.abs() > acc.abs() { s } else { acc });

        let mut levels = [32u8; 16];
        let mut d = 0.0;
        if max_scale != 0.0 {
            let iscale = -32.0 / max_scale;
            for (level, &s) in levels.iter_mut().zip(&scales) {
                *level = (nearest(iscale * s).clamp(-32, 31) + 32) as u8;
            }
            d = 1.0 / iscale;
        }
        let packed_scales = pack_q3_scales(&levels);
        let d = f16::from_f32(d).to_f32();

        let mut quants = [4u8; QK_K];
        for (j, sub) in block.chunks_exact(16).enumerate() {
            let dj = d * unpack_q3_scale(&packed_scales, j) as f32;
            if dj == 0.0 {
                continue;
            }
            for (i, &x) in sub.iter().enumerate() {
                quants[16 * j + i] = (nearest(x / dj).clamp(-4, 3) + 4) as u8;
            }
        }

        // Bit 2 of each quant goes to hmask, the low two bits to qs
        let mut hmask = [0u8; 32];
        for (e, q) in quants.iter_mut().enumerate() {
            if *q > 3 {
                hmask[e % 32] |= 1 << (e / 32);
                *q -= 4;
            }
        }

        out.extend_from_slice(&hmask);
        pack_2bit(&quants, out);
        out.extend_from_slice(&packed_scales);
        put_f16(out, d);
    }
}

pub fn dequantize_q3_k(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(Q3_K_BYTES) {
        let hmask = &block[..32];
        let qs = &block[32..96];
        let scales = &block[96..108];
        let d = get_f16(&block[108..]);
        for e in 0..QK_K {
            let scale = unpack_q3_scale(scales, e / 16) as f32;
            let low = unpack_2bit(qs, e) as i32;
            let high = if hmask[e % 32] & (1 << (e / 32)) != 0 { 0 } else { 4 };
            out.push(d * scale * (low - high) as f32);
        }
    }
}

/// Scale and minimum of Q4_K sub-block `j` from the 12 packed bytes.
fn get_scale_min_k4(j: usize, q: &[u8]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        (
            (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4),
            (q[j + 4] >> 4) | ((q[j] >> 6) << 4),
        )
    }
}

fn pack_q4_k_scales(ls: &[u8; 8], lm: &[u8; 8]) -> [u8; 12] {
    let mut packed = [0u8; 12];
    for j in 0..8 {
        if j < 4 {
            packed[j] = ls[j];
            packed[j + 4] = lm[j];
        } else {
            packed[j + 4] = (ls[j] & 0x0F) | ((lm[j] & 0x0F) << 4);
            packed[j - 4] |= (ls[j] >> 4) << 6;
            packed[j] |= (lm[j] >> 4) << 6;
        }
    }
    packed
}

pub fn quantize_q4_k(src: &[f32], out: &mut Vec<u8>) {
    for block in src.chunks_exact(QK_K) {
        let mut scales = [0.0f32; 8];
        let mut mins = [0.0f32; 8];
        for (j, sub) in block.chunks_exact(32).enumerate() {
            (scales[j], mins[j]) = fit_scale_min(sub, 15.0);
        }
        let max_scale = scales.iter().copied().fold(0.0, f32::max);
        let max_min = mins.iter().copied().fold(0.0, f32::max);
        let inv_scale = if max_scale > 0.0 { 63.0 / max_scale } else { 0.0 };
        let inv_min = if max_min > 0.0 { 63.0 / max_min } else { 0.0 };

        let mut ls = [0u8; 8];
        let mut lm = [0u8; 8];
        for j in 0..8 {
            ls[j] = nearest(inv_scale * scales[j]).clamp(0, 63) as u8;
            lm[j] = nearest(inv_min * mins[j]).clamp(0, 63) as u8;
        }
        let packed_scales = pack_q4_k_scales(&ls, &lm);
        let d = f16::from_f32(max_scale / 63.0).to_f32();
        let dmin = f16::from_f32(max_min / 63.0).to_f32();

        let mut quants = [0u8; QK_K];
        for (j, sub) in block.chunks_exact(32).enumerate() {
            let (sc, m) = get_scale_min_k4(j, &packed_scales);
            let dj = d * sc as f32;
            if dj == 0.0 {
                continue;
            }
            let dm = dmin * m as f32;
            for (i, &x) in sub.iter().enumerate() {
                quants[32 * j + i] = nearest((x + dm) / dj).clamp(0, 15) as u8;
            }
        }

        put_f16(out, d);
        put_f16(out, dmin);
        out.extend_from_slice(&packed_scales);
        for chunk in quants.chunks_exact(64) {
            for l in 0..32 {
                out.push(chunk[l] | (chunk[l + 32] << 4));
            }
        }
    }
}

pub fn dequantize_q4_k(data: &[u8], out: &mut Vec<f32>) {
    for block in data.chunks_exact(Q4_K_BYTES) {
        let d = get_f16(block);
        let dmin = get_f16(&block[2..]);
        let scales = &block[4..16];
        let qs = &block[16..];
        for (chunk, q) in qs.chunks_exact(32).enumerate() {
            let (sc1, m1) = get_scale_min_k4(2 * chunk, scales);
            let (sc2, m2) = get_scale_min_k4(2 * chunk + 1, scales);
            out.extend(q.iter().map(|&b| d * sc1 as f32 * (b & 0x0F) as f32 - dmin * m1 as f32));
            out.extend(q.iter().map(|&b| d * sc2 as f32 * (b >> 4) as f32 - dmin * m2 as f32));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (i as f32 * 0.21).sin() * 0.8 + (i as f32 * 0.05).cos() * 0.2)
            .collect()
    }

    fn check(
        quantize: fn(&[f32], &mut Vec<u8>),
        dequantize: fn(&[u8], &mut Vec<f32>),
        block_bytes: usize,
        tolerance: f32,
    ) {
        let input = sample(2 * QK_K);
        let mut packed = Vec::new();
        quantize(&input, &mut packed);
        assert_eq!(packed.len(), 2 * block_bytes);

        let mut restored = Vec::new();
        dequantize(&packed, &mut restored);
        assert_eq!(restored.len(), input.len());
        let err = input
            .iter()
            .zip(&restored)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);
        assert!(err <= tolerance, "max error {err} above {tolerance}");
    }

    #[test]
    fn test_q2_k_within_tolerance() {
        check(quantize_q2_k, dequantize_q2_k, Q2_K_BYTES, 0.6);
    }

    #[test]
    fn test_q3_k_within_tolerance() {
        check(quantize_q3_k, dequantize_q3_k, Q3_K_BYTES, 0.35);
    }

    #[test]
    fn test_q4_k_within_tolerance() {
        check(quantize_q4_k, dequantize_q4_k, Q4_K_BYTES, 0.2);
    }

    #[test]
    fn test_q3_scale_packing_roundtrip() {
        let mut levels = [0u8; 16];
        for (j, l) in levels.iter_mut().enumerate() {
            *l = (j as u8 * 5 + 3) % 64;
        }
        let packed = pack_q3_scales(&levels);
        for (j, &l) in levels.iter().enumerate() {
            assert_eq!(unpack_q3_scale(&packed, j), l as i32 - 32);
        }
    }

    #[test]
    fn test_q4_k_scale_packing_roundtrip() {
        let ls = [1, 20, 33, 63, 0, 45, 17, 62];
        let lm = [63, 0, 12, 40, 51, 2, 63, 31];
        let packed = pack_q4_k_scales(&ls, &lm);
        for j in 0..8 {
            assert_eq!(get_scale_min_k4(j, &packed), (ls[j], lm[j]));
        }
    }

    #[test]
    fn test_constant_block() {
        let input = vec![0.25f32; QK_K];
        let mut packed = Vec::new();
        quantize_q4_k(&input, &mut packed);
        let mut restored = Vec::new();
        dequantize_q4_k(&packed, &mut restored);
        assert!(restored.iter().all(|v| (v - 0.25).abs() < 0.02));
    }
}
