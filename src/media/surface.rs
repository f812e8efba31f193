//! Display surfaces
//!
//! Tracks are rendered into surfaces as frames arrive. A surface is cleared
//! when the handle feeding it is cleaned up, and closed on shutdown.

use std::fs::File;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::RelayResult;
use crate::media::ivf::{IvfHeader, IvfWriter};
use crate::media::VideoFrame;

pub trait Surface {
    fn render(&mut self, frame: &VideoFrame) -> RelayResult<()>;

    /// Remove whatever is currently shown.
    fn clear(&mut self) -> RelayResult<()>;

    /// Stop rendering and keep what was rendered so far.
    fn close(&mut self) -> RelayResult<()>;

    /// Frames rendered since the last clear.
    fn frames(&self) -> u64;
}

/// Surface that only counts and logs frames.
pub struct LogSurface {
    name: &'static str,
    frames: u64,
}

impl LogSurface {
    pub fn new(name: &'static str) -> Self {
        Self { name, frames: 0 }
    }
}

impl Surface for LogSurface {
    fn render(&mut self, frame: &VideoFrame) -> RelayResult<()> {
        self.frames += 1;
        if self.frames == 1 || self.frames % 300 == 0 {
            info!(
                "🖼  {}: {} frames ({} {} bytes)",
                self.name,
                self.frames,
                frame.codec,
                frame.data.len()
            );
        }
        Ok(())
    }

    fn clear(&mut self) -> RelayResult<()> {
        info!("{}: cleared after {} frames", self.name, self.frames);
        self.frames = 0;
        Ok(())
    }

    fn close(&mut self) -> RelayResult<()> {
        info!("{}: closed after {} frames", self.name, self.frames);
        Ok(())
    }

    fn frames(&self) -> u64 {
        self.frames
    }
}

/// Surface that records frames into an IVF file. The file is created on the
/// first frame, with the codec of that frame, and truncated on clear.
pub struct IvfSurface {
    path: PathBuf,
    width: u16,
    height: u16,
    writer: Option<IvfWriter<File>>,
    first_rtp_time: u64,
}

impl IvfSurface {
    pub fn new(path: impl Into<PathBuf>, width: u16, height: u16) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            writer: None,
            first_rtp_time: 0,
        }
    }
}

impl Surface for IvfSurface {
    fn render(&mut self, frame: &VideoFrame) -> RelayResult<()> {
        if self.writer.is_none() {
            let header = IvfHeader {
                codec: frame.codec,
                width: self.width,
                height: self.height,
                // pts are in RTP clock units
                timebase_den: 90_000,
                timebase_num: 1,
                frame_count: 0,
            };
            let writer = IvfWriter::new(File::create(&self.path)?, header)?;
            info!("Recording {} into {}", frame.codec, self.path.display());
            self.first_rtp_time = frame.rtp_time;
            self.writer = Some(writer);
        }

        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let pts = frame.rtp_time.wrapping_sub(self.first_rtp_time);
        writer.write_frame(pts, &frame.data)?;

        // Keep the header count usable if the process dies.
        if writer.frame_count() % 30 == 0 {
            writer.flush()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> RelayResult<()> {
        if let Some(writer) = self.writer.take() {
            drop(writer);
            File::create(&self.path)?;
            debug!("Truncated {}", self.path.display());
        }
        Ok(())
    }

    fn close(&mut self) -> RelayResult<()> {
        if let Some(writer) = self.writer.take() {
            let frames = writer.frame_count();
            writer.into_inner()?;
            info!("Recorded {} frames into {}", frames, self.path.display());
        }
        Ok(())
    }

    fn frames(&self) -> u64 {
        self.writer
            .as_ref()
            .map(|w| u64::from(w.frame_count()))
            .unwrap_or(0)
    }
}

impl Drop for IvfSurface {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::media::ivf::IvfReader;
    use crate::model::codec::VideoCodec;

    fn frame(rtp_time: u64) -> VideoFrame {
        VideoFrame {
            codec: VideoCodec::Vp9,
            rtp_time,
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn ivf_surface_records_relative_pts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.ivf");

        {
            let mut surface = IvfSurface::new(&path, 1280, 720);
            surface.render(&frame(90_000)).unwrap();
            surface.render(&frame(93_000)).unwrap();
            assert_eq!(surface.frames(), 2);
        }

        let mut reader = IvfReader::new(fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.header().codec, VideoCodec::Vp9);
        assert_eq!(reader.header().frame_count, 2);
        assert_eq!(reader.next_frame().unwrap().unwrap().pts, 0);
        assert_eq!(reader.next_frame().unwrap().unwrap().pts, 3000);
    }

    #[test]
    fn clear_empties_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.ivf");

        let mut surface = IvfSurface::new(&path, 640, 480);
        surface.render(&frame(0)).unwrap();
        surface.clear().unwrap();

        assert_eq!(surface.frames(), 0);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn close_keeps_the_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.ivf");

        let mut surface = IvfSurface::new(&path, 640, 480);
        surface.render(&frame(0)).unwrap();
        surface.render(&frame(3000)).unwrap();
        surface.close().unwrap();
        // Closing twice is harmless.
        surface.close().unwrap();

        let mut reader = IvfReader::new(fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.header().frame_count, 2);
        assert_eq!(reader.next_frame().unwrap().unwrap().data, vec![1, 2, 3]);
        assert_eq!(reader.next_frame().unwrap().unwrap().pts, 3000);
    }

    #[test]
    fn log_surface_counts() {
        let mut surface = LogSurface::new("remote");
        surface.render(&frame(0)).unwrap();
        surface.render(&frame(1)).unwrap();
        assert_eq!(surface.frames(), 2);
        surface.clear().unwrap();
        assert_eq!(surface.frames(), 0);
    }
}
