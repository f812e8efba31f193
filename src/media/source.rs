//! The local video feed
//!
//! An IVF file stands in for the camera. Frames are handed out at the file's
//! frame rate and the file loops when it runs out.

use std::fs::File;
use std::io::BufReader;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::MediaConfig;
use crate::error::{RelayError, RelayResult};
use crate::media::ivf::{IvfHeader, IvfReader};
use crate::media::VideoFrame;

const VIDEO_CLOCK_RATE: u64 = 90_000;
const FALLBACK_FPS: u32 = 30;

pub struct LocalStream {
    reader: IvfReader<BufReader<File>>,
    frame_interval: Duration,
    rtp_ticks_per_frame: u64,
    rtp_time: u64,
    next_due: Instant,
    frames: u64,
}

impl LocalStream {
    /// Open the configured source. Fails when the file is missing, is not
    /// IVF, or carries a different codec than configured.
    pub fn acquire(config: &MediaConfig) -> RelayResult<Self> {
        let file = File::open(&config.source).map_err(|e| {
            RelayError::Media(format!("cannot open {}: {e}", config.source.display()))
        })?;
        let reader = IvfReader::new(BufReader::new(file))?;
        let header = *reader.header();

        if header.codec != config.codec {
            return Err(RelayError::Media(format!(
                "{} contains {}, configured codec is {}",
                config.source.display(),
                header.codec,
                config.codec
            )));
        }

        if u32::from(header.width) != config.width || u32::from(header.height) != config.height {
            warn!(
                "Source is {}x{}, requested {}x{}",
                header.width, header.height, config.width, config.height
            );
        }

        let fps = frame_rate(&header);
        info!(
            "📷 Local media: {} {}x{} @ {} fps from {}",
            header.codec,
            header.width,
            header.height,
            fps,
            config.source.display()
        );

        Ok(Self {
            reader,
            frame_interval: Duration::from_secs(1) / fps,
            rtp_ticks_per_frame: VIDEO_CLOCK_RATE / u64::from(fps),
            rtp_time: 0,
            next_due: Instant::now(),
            frames: 0,
        })
    }

    /// When the next frame should be sent.
    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Return the next frame if it is due at `now`.
    pub fn poll_frame(&mut self, now: Instant) -> RelayResult<Option<VideoFrame>> {
        if now < self.next_due {
            return Ok(None);
        }

        let frame = match self.reader.next_frame()? {
            Some(frame) => frame,
            None => {
                self.reader.rewind()?;
                self.reader
                    .next_frame()?
                    .ok_or_else(|| RelayError::Media("source contains no frames".into()))?
            }
        };

        // Don't try to catch up after a stall, just keep the cadence from now.
        self.next_due = (self.next_due + self.frame_interval).max(now);
        let rtp_time = self.rtp_time;
        self.rtp_time = self.rtp_time.wrapping_add(self.rtp_ticks_per_frame);
        self.frames += 1;

        Ok(Some(VideoFrame {
            codec: self.reader.header().codec,
            rtp_time,
            data: frame.data,
        }))
    }

    /// Start over from the first frame, which is a keyframe.
    pub fn restart(&mut self) -> RelayResult<()> {
        self.reader.rewind()
    }
}

fn frame_rate(header: &IvfHeader) -> u32 {
    if header.timebase_den == 0 || header.timebase_num == 0 {
        return FALLBACK_FPS;
    }
    (header.timebase_den / header.timebase_num).clamp(1, 120)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::path::Path;

    use super::*;
    use crate::media::ivf::IvfWriter;
    use crate::model::codec::VideoCodec;

    fn write_source(path: &Path, codec: VideoCodec, frames: &[&[u8]]) {
        let header = IvfHeader {
            codec,
            width: 1280,
            height: 720,
            timebase_den: 30,
            timebase_num: 1,
            frame_count: 0,
        };
        let mut writer = IvfWriter::new(File::create(path).unwrap(), header).unwrap();
        for (i, f) in frames.iter().enumerate() {
            writer.write_frame(i as u64, f).unwrap();
        }
        writer.flush().unwrap();
    }

    fn media_config(path: &Path) -> MediaConfig {
        MediaConfig {
            source: path.to_path_buf(),
            ..MediaConfig::default()
        }
    }

    #[test]
    fn frames_loop_with_increasing_rtp_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.ivf");
        write_source(&path, VideoCodec::Vp9, &[b"a", b"b"]);

        let mut stream = LocalStream::acquire(&media_config(&path)).unwrap();
        let start = Instant::now();
        let mut seen = vec![];
        for i in 0..3u32 {
            let frame = stream
                .poll_frame(start + Duration::from_secs(1) * i)
                .unwrap()
                .unwrap();
            seen.push((frame.data, frame.rtp_time));
        }

        assert_eq!(seen[0], (b"a".to_vec(), 0));
        assert_eq!(seen[1], (b"b".to_vec(), 3000));
        assert_eq!(seen[2], (b"a".to_vec(), 6000));
        assert_eq!(stream.frames(), 3);
    }

    #[test]
    fn frame_is_not_returned_before_due() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.ivf");
        write_source(&path, VideoCodec::Vp9, &[b"a"]);

        let mut stream = LocalStream::acquire(&media_config(&path)).unwrap();
        let now = Instant::now() + Duration::from_millis(1);
        assert!(stream.poll_frame(now).unwrap().is_some());
        assert!(stream.poll_frame(now).unwrap().is_none());
    }

    #[test]
    fn acquisition_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.ivf");
        assert!(matches!(
            LocalStream::acquire(&media_config(&missing)),
            Err(RelayError::Media(_))
        ));

        let vp8 = dir.path().join("vp8.ivf");
        write_source(&vp8, VideoCodec::Vp8, &[b"a"]);
        assert!(matches!(
            LocalStream::acquire(&media_config(&vp8)),
            Err(RelayError::Media(_))
        ));
    }
}
