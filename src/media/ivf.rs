//! IVF container reading and writing
//!
//! IVF is a 32 byte file header followed by frames, each prefixed with a 12
//! byte header (little endian size and presentation timestamp).

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{RelayError, RelayResult};
use crate::model::codec::VideoCodec;

const SIGNATURE: &[u8; 4] = b"DKIF";
const HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 12;
const FRAME_COUNT_OFFSET: u64 = 24;

/// Upper bound for a single frame, protects against corrupt size fields.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    /// Timebase denominator; the frame rate for constant rate files
    pub timebase_den: u32,
    pub timebase_num: u32,
    pub frame_count: u32,
}

impl IvfHeader {
    fn parse(buf: &[u8; HEADER_LEN]) -> RelayResult<Self> {
        if &buf[0..4] != SIGNATURE {
            return Err(RelayError::Media("not an IVF file".into()));
        }

        let header_len = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        if header_len != HEADER_LEN {
            return Err(RelayError::Media(format!(
                "unsupported IVF header length {header_len}"
            )));
        }

        let codec = VideoCodec::from_fourcc(&buf[8..12]).ok_or_else(|| {
            RelayError::Media(format!(
                "unsupported IVF fourcc {}",
                String::from_utf8_lossy(&buf[8..12])
            ))
        })?;

        Ok(Self {
            codec,
            width: u16::from_le_bytes([buf[12], buf[13]]),
            height: u16::from_le_bytes([buf[14], buf[15]]),
            timebase_den: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            timebase_num: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            frame_count: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }

    fn to_bytes(self) -> RelayResult<[u8; HEADER_LEN]> {
        let fourcc = self.codec.fourcc().ok_or_else(|| {
            RelayError::Media(format!("{} cannot be stored in IVF", self.codec))
        })?;

        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(SIGNATURE);
        buf[6..8].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
        buf[8..12].copy_from_slice(fourcc);
        buf[12..14].copy_from_slice(&self.width.to_le_bytes());
        buf[14..16].copy_from_slice(&self.height.to_le_bytes());
        buf[16..20].copy_from_slice(&self.timebase_den.to_le_bytes());
        buf[20..24].copy_from_slice(&self.timebase_num.to_le_bytes());
        buf[24..28].copy_from_slice(&self.frame_count.to_le_bytes());
        Ok(buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfFrame {
    pub pts: u64,
    pub data: Vec<u8>,
}

pub struct IvfReader<R> {
    inner: R,
    header: IvfHeader,
}

impl<R: Read + Seek> IvfReader<R> {
    pub fn new(mut inner: R) -> RelayResult<Self> {
        let mut buf = [0u8; HEADER_LEN];
        inner
            .read_exact(&mut buf)
            .map_err(|e| RelayError::Media(format!("short IVF header: {e}")))?;
        let header = IvfHeader::parse(&buf)?;
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> &IvfHeader {
        &self.header
    }

    /// Read the next frame, `None` at the end of the file.
    pub fn next_frame(&mut self) -> RelayResult<Option<IvfFrame>> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        match self.inner.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if len > MAX_FRAME_LEN {
            return Err(RelayError::Media(format!("IVF frame of {len} bytes")));
        }
        let mut pts = [0u8; 8];
        pts.copy_from_slice(&head[4..12]);

        let mut data = vec![0; len as usize];
        match self.inner.read_exact(&mut data) {
            Ok(()) => {}
            // Truncated last frame, treat as the end of the file.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        Ok(Some(IvfFrame {
            pts: u64::from_le_bytes(pts),
            data,
        }))
    }

    /// Seek back to the first frame.
    pub fn rewind(&mut self) -> RelayResult<()> {
        self.inner.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        Ok(())
    }
}

pub struct IvfWriter<W> {
    inner: W,
    header: IvfHeader,
}

impl<W: Write + Seek> IvfWriter<W> {
    pub fn new(mut inner: W, header: IvfHeader) -> RelayResult<Self> {
        let header = IvfHeader {
            frame_count: 0,
            ..header
        };
        inner.write_all(&header.to_bytes()?)?;
        Ok(Self { inner, header })
    }

    pub fn write_frame(&mut self, pts: u64, data: &[u8]) -> RelayResult<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| RelayError::Media("frame too large for IVF".into()))?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&pts.to_le_bytes())?;
        self.inner.write_all(data)?;
        self.header.frame_count = self.header.frame_count.saturating_add(1);
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.header.frame_count
    }

    /// Patch the frame count into the header and flush.
    pub fn flush(&mut self) -> RelayResult<()> {
        let pos = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(FRAME_COUNT_OFFSET))?;
        self.inner
            .write_all(&self.header.frame_count.to_le_bytes())?;
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(mut self) -> RelayResult<W> {
        self.flush()?;
        Ok(self.inner)
    }
}
