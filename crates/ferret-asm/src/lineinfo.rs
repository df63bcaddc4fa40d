//! Per-instruction line number compression
//!
//! Lines inside each span are stored as an 8-bit delta to the span baseline.
//! The span is always a power of two; it starts at 2^24 and is halved until
//! every window's `max - min` fits in 8 bits. Baselines are written once per
//! span as a delta against the previous baseline, and the per-instruction
//! deltas are themselves delta-encoded against the previous stored delta so
//! that steady runs compress to zero bytes after downstream compression.

use crate::writer::{write_byte, write_i32};

fn log2(v: usize) -> u32 {
    assert!(v != 0);

    let mut r = 0;

    while v >= (2 << r) {
        r += 1;
    }

    r
}

/// Encode the line array into `out`.
///
/// `lines` must be non-empty; entries of 0 ("no line info") must be filtered
/// out by the caller beforehand by skipping the encoder entirely.
pub fn encode(lines: &[i32], out: &mut Vec<u8>) {
    assert!(!lines.is_empty());

    let mut span: usize = 1 << 24;

    // first pass: determine span length
    let mut offset = 0;
    while offset < lines.len() {
        let mut next = offset;

        let mut min = lines[offset];
        let mut max = lines[offset];

        while next < lines.len() && next < offset + span {
            min = min.min(lines[next]);
            max = max.max(lines[next]);

            if max - min > 255 {
                break;
            }

            next += 1;
        }

        if next < lines.len() && next - offset < span {
            // since not all lines in the range fit in 8b delta, we need to shrink the span
            // next iteration will need to reprocess some lines again since span changed
            span = 1 << log2(next - offset);
        }

        offset += span;
    }

    // second pass: compute span baselines
    let baseline_size = (lines.len() - 1) / span + 1;
    let mut baseline = vec![0i32; baseline_size];

    let mut offset = 0;
    while offset < lines.len() {
        let mut min = lines[offset];

        let mut next = offset;
        while next < lines.len() && next < offset + span {
            min = min.min(lines[next]);
            next += 1;
        }

        baseline[offset / span] = min;
        offset += span;
    }

    // third pass: write resulting data
    let logspan = log2(span);

    write_byte(out, logspan as u8);

    let mut last_offset = 0u8;

    for (i, &line) in lines.iter().enumerate() {
        let delta = line - baseline[i >> logspan];
        assert!((0..=255).contains(&delta));

        write_byte(out, (delta as u8).wrapping_sub(last_offset));
        last_offset = delta as u8;
    }

    let mut last_line = 0;

    for &base in &baseline {
        write_i32(out, base - last_line);
        last_line = base;
    }
}

/// Decode an encoded line table back into one line per instruction.
///
/// Structural inverse of [`encode`]; used by diagnostics tooling and tests.
/// Returns `None` if `data` is truncated.
pub fn decode(data: &[u8], count: usize) -> Option<Vec<i32>> {
    let logspan = *data.first()? as u32;

    let deltas = data.get(1..1 + count)?;

    let baseline_size = if count == 0 { 0 } else { ((count - 1) >> logspan) + 1 };
    let baseline_bytes = data.get(1 + count..1 + count + baseline_size * 4)?;

    let mut baseline = Vec::with_capacity(baseline_size);
    let mut last_line = 0i32;

    for chunk in baseline_bytes.chunks_exact(4) {
        last_line += i32::from_le_bytes(chunk.try_into().ok()?);
        baseline.push(last_line);
    }

    let mut lines = Vec::with_capacity(count);
    let mut last_offset = 0u8;

    for (i, &delta) in deltas.iter().enumerate() {
        last_offset = last_offset.wrapping_add(delta);
        lines.push(baseline[i >> logspan] + last_offset as i32);
    }

    Some(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(lines: &[i32]) -> Vec<i32> {
        let mut out = Vec::new();
        encode(lines, &mut out);
        decode(&out, lines.len()).expect("encoded data is complete")
    }

    #[test]
    fn test_steady_run() {
        let lines = vec![1, 1, 2, 2, 3, 3, 4];
        assert_eq!(roundtrip(&lines), lines);
    }

    #[test]
    fn test_single_line_function() {
        let lines = vec![7];
        assert_eq!(roundtrip(&lines), lines);
    }

    #[test]
    fn test_outlier_shrinks_span() {
        // one instruction 300 lines away from its neighbors forces the span
        // below the full function length, since 300 > 255
        let mut lines = vec![10; 64];
        lines[32] = 310;

        let mut out = Vec::new();
        encode(&lines, &mut out);

        let logspan = out[0] as u32;
        assert!((1usize << logspan) < lines.len());

        // every span's delta still fits 8 bits and decoding is lossless
        assert_eq!(decode(&out, lines.len()).unwrap(), lines);
    }

    #[test]
    fn test_large_monotonic() {
        let lines: Vec<i32> = (1..=1000).collect();
        assert_eq!(roundtrip(&lines), lines);
    }

    #[test]
    fn test_sawtooth() {
        let lines: Vec<i32> = (0..512).map(|i| 100 + (i % 7) * 40).collect();
        assert_eq!(roundtrip(&lines), lines);
    }
}
