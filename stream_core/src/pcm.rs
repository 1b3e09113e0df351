//! Stateless PCM transforms applied once to a finalized payload.

use std::io::Cursor;

use tracing::warn;

use crate::format::{AudioFormat, BITS_PER_SAMPLE};

/// Decode 16-bit little-endian PCM into samples in `[-1.0, 1.0)`.
///
/// A trailing odd byte (half a sample) is ignored.
pub fn decode_linear16(pcm: &[u8]) -> Vec<f32> {
    if pcm.len() % 2 != 0 {
        warn!(bytes = pcm.len(), "PCM payload has an odd length; dropping the last byte");
    }
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Wrap raw 16-bit PCM in a RIFF/WAV container so a stock player can open it.
pub fn encode_wav(pcm: &[u8], format: &AudioFormat) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };

    let mut out = Cursor::new(Vec::with_capacity(44 + pcm.len()));
    {
        let mut writer = hound::WavWriter::new(&mut out, spec)?;
        for pair in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(out.into_inner())
}
