//! Local media acquisition and display surfaces

pub mod ivf;
pub mod source;
pub mod surface;

use crate::model::codec::VideoCodec;

/// One encoded video frame with its 90kHz RTP timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub codec: VideoCodec,
    pub rtp_time: u64,
    pub data: Vec<u8>,
}
