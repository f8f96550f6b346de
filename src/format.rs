//! Audio container/codec format tags for cached artifacts.

use serde::{Deserialize, Serialize};

/// Format of an audio artifact, on disk and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// MPEG layer III, the canonical storage format providers return.
    #[default]
    Mp3,
    /// Opus in an OGG container (voice messaging clients).
    Opus,
    /// Vorbis in an OGG container.
    Ogg,
    /// Uncompressed RIFF/WAVE.
    Wav,
}

impl AudioFormat {
    /// File extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
        }
    }

    /// HTTP `content-type` for responses carrying this format.
    pub fn media_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Opus | Self::Ogg => "audio/ogg",
            Self::Wav => "audio/wav",
        }
    }

    /// Parse a format tag or file extension.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mp3" => Some(Self::Mp3),
            "opus" => Some(Self::Opus),
            "ogg" => Some(Self::Ogg),
            "wav" => Some(Self::Wav),
            _ => None,
        }
    }

    /// Parse the extension of an artifact path.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        path.extension().and_then(|e| e.to_str()).and_then(Self::parse)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}
