//! Audio format descriptor.
//!
//! The relay only ever carries one format: 16-bit signed little-endian PCM,
//! 24 kHz, mono. Anything else is rejected at request validation time.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Linear16,
}

impl Encoding {
    /// Name used in provider query strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Linear16 => "linear16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const LINEAR16_24K_MONO: AudioFormat = AudioFormat {
        encoding: Encoding::Linear16,
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
    };

    pub fn validate(&self) -> Result<(), StreamError> {
        if *self != Self::LINEAR16_24K_MONO {
            return Err(StreamError::InvalidRequest(format!(
                "Unsupported audio format {}/{}Hz/{}ch. Expected linear16/{}Hz/{}ch",
                self.encoding.as_str(),
                self.sample_rate,
                self.channels,
                SAMPLE_RATE,
                CHANNELS
            )));
        }
        Ok(())
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (BITS_PER_SAMPLE as usize / 8)
    }

    /// Playback length of `bytes` of audio in this format.
    pub fn duration_ms(&self, bytes: usize) -> u64 {
        let frames = (bytes / self.bytes_per_frame()) as u64;
        frames * 1000 / self.sample_rate as u64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::LINEAR16_24K_MONO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_is_valid() {
        assert!(AudioFormat::default().validate().is_ok());
    }

    #[test]
    fn test_other_sample_rates_are_rejected() {
        let format = AudioFormat {
            sample_rate: 16_000,
            ..AudioFormat::default()
        };
        let err = format.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn test_duration_of_one_second() {
        let format = AudioFormat::default();
        assert_eq!(format.duration_ms(48_000), 1000);
        assert_eq!(format.duration_ms(0), 0);
    }
}
