//! Video codecs the relay can publish and forward

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodec {
    /// The IVF fourcc used for this codec, if it can be stored in IVF.
    pub fn fourcc(&self) -> Option<&'static [u8; 4]> {
        match self {
            VideoCodec::Vp8 => Some(b"VP80"),
            VideoCodec::Vp9 => Some(b"VP90"),
            VideoCodec::H264 => None,
        }
    }

    pub fn from_fourcc(fourcc: &[u8]) -> Option<Self> {
        match fourcc {
            b"VP80" => Some(VideoCodec::Vp8),
            b"VP90" => Some(VideoCodec::Vp9),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::H264 => "h264",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoCodec {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vp8" => Ok(VideoCodec::Vp8),
            "vp9" => Ok(VideoCodec::Vp9),
            "h264" => Ok(VideoCodec::H264),
            other => Err(RelayError::Config(format!("unknown codec '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_maps_back_to_codec() {
        assert_eq!(VideoCodec::from_fourcc(b"VP90"), Some(VideoCodec::Vp9));
        assert_eq!(VideoCodec::from_fourcc(b"AV01"), None);
        assert_eq!(VideoCodec::H264.fourcc(), None);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("VP8".parse::<VideoCodec>().unwrap(), VideoCodec::Vp8);
        assert!("theora".parse::<VideoCodec>().is_err());
    }
}
