use std::io::{self, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::frame::SpectrumFrame;

/// Frame as it travels to subscribers: the magnitude vector replaced by
/// its base64(gzip(little-endian f32)) encoding.
#[derive(Debug, Clone, Serialize)]
pub struct WireFrame {
    pub sequence_id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sample_rate: u32,
    pub fft_size: usize,
    pub bins_count: usize,
    pub peak_frequency_hz: f32,
    pub peak_magnitude_db: f32,
    pub spl_db: f32,
    pub fps: f32,
    pub data_compressed: String,
    pub compression_method: &'static str,
    pub data_size_bytes: usize,
    pub original_size_bytes: usize,
}

/// Encode a spectrum for the wire at the given gzip level (1..=9).
pub fn encode(frame: &SpectrumFrame, compression_level: u32) -> io::Result<WireFrame> {
    let mut raw = Vec::with_capacity(frame.magnitudes_db.len() * 4);
    for &m in &frame.magnitudes_db {
        raw.extend_from_slice(&m.to_le_bytes());
    }
    let original_size_bytes = raw.len();

    let mut encoder = GzEncoder::new(
        Vec::with_capacity(original_size_bytes / 4),
        Compression::new(compression_level.clamp(1, 9)),
    );
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;
    let data_size_bytes = compressed.len();

    Ok(WireFrame {
        sequence_id: frame.sequence_id,
        timestamp: frame.timestamp_ms,
        sample_rate: frame.sample_rate,
        fft_size: frame.fft_size,
        bins_count: frame.bins_count,
        peak_frequency_hz: frame.peak_frequency_hz,
        peak_magnitude_db: frame.peak_magnitude_db,
        spl_db: frame.spl_db,
        fps: frame.fps,
        data_compressed: BASE64.encode(&compressed),
        compression_method: "gzip",
        data_size_bytes,
        original_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn sample_frame(bins: usize) -> SpectrumFrame {
        SpectrumFrame {
            sequence_id: 7,
            timestamp_ms: 1_700_000_000_000,
            sample_rate: 384_000,
            fft_size: bins * 2,
            bins_count: bins,
            magnitudes_db: (0..bins).map(|i| -100.0 + (i as f32 % 60.0)).collect(),
            peak_frequency_hz: 42_000.0,
            peak_magnitude_db: -41.0,
            spl_db: 55.0,
            fps: 30.0,
        }
    }

    fn decode(wire: &WireFrame) -> Vec<f32> {
        let compressed = BASE64.decode(&wire.data_compressed).unwrap();
        assert_eq!(compressed.len(), wire.data_size_bytes);
        let mut raw = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut raw).unwrap();
        assert_eq!(raw.len(), wire.original_size_bytes);
        raw.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    #[test]
    fn decoded_payload_matches_bin_count() {
        let frame = sample_frame(4096);
        let wire = encode(&frame, 6).unwrap();
        assert_eq!(wire.original_size_bytes, 4 * wire.bins_count);
        assert_eq!(wire.bins_count, wire.fft_size / 2);
        let decoded = decode(&wire);
        assert_eq!(decoded.len(), frame.bins_count);
    }

    #[test]
    fn round_trip_preserves_magnitudes() {
        let frame = sample_frame(512);
        let wire = encode(&frame, 9).unwrap();
        let decoded = decode(&wire);
        assert_eq!(decoded, frame.magnitudes_db);
    }

    #[test]
    fn level_one_is_larger_than_level_nine() {
        let frame = sample_frame(4096);
        let fast = encode(&frame, 1).unwrap();
        let small = encode(&frame, 9).unwrap();
        assert!(fast.data_size_bytes >= small.data_size_bytes);
    }

    #[test]
    fn wire_json_uses_contract_field_names() {
        let wire = encode(&sample_frame(256), 6).unwrap();
        let json = serde_json::to_value(&wire).unwrap();
        for key in [
            "sequence_id",
            "timestamp",
            "sample_rate",
            "fft_size",
            "bins_count",
            "peak_frequency_hz",
            "peak_magnitude_db",
            "spl_db",
            "fps",
            "data_compressed",
            "data_size_bytes",
            "original_size_bytes",
        ] {
            assert!(json.get(key).is_some(), "missing field {key}");
        }
        assert_eq!(json["compression_method"], "gzip");
    }
}
