// SPDX-License-Identifier: MPL-2.0

//! Decoded frame output.
//!
//! [`FileFrameSink`] writes planar pictures either raw or as a YUV4MPEG2
//! stream, and optionally checksums them:
//!
//! ```text
//! per-frame CRC  -> "frame <n>: 0xXXXXXXXX ..." lines, one value per seed
//! aggregate CRC  -> "CRC: 0xXXXXXXXX ..." once at finish, one value per seed
//! ```

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use eyre::WrapErr;
use tracing::{debug, info};

use crate::stream::{ChromaSubsampling, Extent};

const Y4M_DEFAULT_FRAME_RATE: (u32, u32) = (30, 1);

/// One decoded picture in planar layout, rows tightly packed. Samples deeper
/// than 8 bits use two little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Decode order index.
    pub index: u64,
    /// Step that produced the frame.
    pub step: u64,
    pub pts: Option<u64>,
    pub extent: Extent,
    pub chroma: ChromaSubsampling,
    pub bit_depth: u32,
    pub frame_rate: Option<(u32, u32)>,
    pub planes: Vec<Vec<u8>>,
}

impl DecodedFrame {
    /// Bytes used by one sample.
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        if self.bit_depth > 8 { 2 } else { 1 }
    }

    /// Expected byte length of each plane.
    #[must_use]
    pub fn plane_sizes(&self) -> Vec<usize> {
        let bps = self.bytes_per_sample();
        let luma = self.extent.width as usize * self.extent.height as usize * bps;
        let (sx, sy) = self.chroma.shift();
        let cw = (self.extent.width as usize + (1 << sx) - 1) >> sx;
        let ch = (self.extent.height as usize + (1 << sy) - 1) >> sy;

        let mut sizes = vec![luma];
        if self.chroma.plane_count() == 3 {
            sizes.push(cw * ch * bps);
            sizes.push(cw * ch * bps);
        }
        sizes
    }
}

/// Consumer of decoded frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &DecodedFrame) -> eyre::Result<()>;

    /// Flush outputs and return the aggregate CRC per seed, empty when CRC
    /// output is disabled.
    fn finish(&mut self) -> eyre::Result<Vec<u32>>;
}

/// Options used to open a frame sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOptions {
    pub path: PathBuf,
    /// Emit a YUV4MPEG2 stream header and per-frame markers.
    pub y4m: bool,
    pub crc: bool,
    pub crc_per_frame: bool,
    /// Destination of CRC lines, stdout when unset.
    pub crc_path: Option<PathBuf>,
    pub crc_seeds: Vec<u32>,
}

impl SinkOptions {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            y4m: false,
            crc: false,
            crc_per_frame: false,
            crc_path: None,
            crc_seeds: vec![0],
        }
    }
}

/// File backed [`FrameSink`].
pub struct FileFrameSink {
    output: BufWriter<File>,
    crc_output: Option<Box<dyn Write>>,
    y4m: bool,
    header_written: bool,
    crc_per_frame: bool,
    seeds: Vec<u32>,
    running: Option<Vec<crc32fast::Hasher>>,
    frames_written: u64,
}

impl FileFrameSink {
    /// Create the output file and, if requested, the CRC file.
    pub fn open(options: &SinkOptions) -> eyre::Result<Self> {
        let file = File::create(&options.path)
            .wrap_err_with(|| format!("cannot create {}", options.path.display()))?;

        let wants_crc = options.crc || options.crc_per_frame;
        if wants_crc && options.crc_seeds.is_empty() {
            eyre::bail!("CRC output requested without a seed");
        }

        let crc_output: Option<Box<dyn Write>> = match (&options.crc_path, wants_crc) {
            (Some(path), true) => {
                let file = File::create(path)
                    .wrap_err_with(|| format!("cannot create {}", path.display()))?;
                Some(Box::new(BufWriter::new(file)))
            }
            (None, true) => Some(Box::new(std::io::stdout())),
            (_, false) => None,
        };

        let running = options.crc.then(|| {
            options
                .crc_seeds
                .iter()
                .map(|&seed| crc32fast::Hasher::new_with_initial(seed))
                .collect()
        });

        debug!(
            path = %options.path.display(),
            y4m = options.y4m,
            crc = options.crc,
            crc_per_frame = options.crc_per_frame,
            "Opened frame sink"
        );

        Ok(Self {
            output: BufWriter::new(file),
            crc_output,
            y4m: options.y4m,
            header_written: false,
            crc_per_frame: options.crc_per_frame,
            seeds: options.crc_seeds.clone(),
            running,
            frames_written: 0,
        })
    }

    /// Frames written so far.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn write_y4m_header(&mut self, frame: &DecodedFrame) -> eyre::Result<()> {
        let (num, den) = frame.frame_rate.unwrap_or(Y4M_DEFAULT_FRAME_RATE);
        writeln!(
            self.output,
            "YUV4MPEG2 W{} H{} F{num}:{den} Ip A1:1 C{}",
            frame.extent.width,
            frame.extent.height,
            y4m_colorspace(frame.chroma, frame.bit_depth)
        )?;
        Ok(())
    }
}

impl FrameSink for FileFrameSink {
    fn write_frame(&mut self, frame: &DecodedFrame) -> eyre::Result<()> {
        let expected = frame.plane_sizes();
        if frame.planes.len() != expected.len() {
            eyre::bail!(
                "frame {} has {} planes, expected {}",
                frame.index,
                frame.planes.len(),
                expected.len()
            );
        }
        for (plane, (data, size)) in frame.planes.iter().zip(&expected).enumerate() {
            if data.len() != *size {
                eyre::bail!(
                    "frame {} plane {plane} is {} bytes, expected {size}",
                    frame.index,
                    data.len()
                );
            }
        }

        if self.y4m {
            if !self.header_written {
                self.write_y4m_header(frame)?;
                self.header_written = true;
            }
            self.output.write_all(b"FRAME\n")?;
        }

        for plane in &frame.planes {
            self.output.write_all(plane)?;
        }

        if let Some(running) = self.running.as_mut() {
            for hasher in running.iter_mut() {
                for plane in &frame.planes {
                    hasher.update(plane);
                }
            }
        }

        if self.crc_per_frame {
            let crcs = frame_crc(frame, &self.seeds);
            if let Some(out) = self.crc_output.as_mut() {
                write!(out, "frame {}:", frame.index)?;
                for crc in crcs {
                    write!(out, " 0x{crc:08X}")?;
                }
                writeln!(out)?;
            }
        }

        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> eyre::Result<Vec<u32>> {
        self.output.flush().wrap_err("failed to flush frame output")?;

        let crcs: Vec<u32> = self
            .running
            .take()
            .map(|running| running.into_iter().map(crc32fast::Hasher::finalize).collect())
            .unwrap_or_default();

        if let Some(out) = self.crc_output.as_mut() {
            if !crcs.is_empty() {
                write!(out, "CRC: ")?;
                for crc in &crcs {
                    write!(out, "0x{crc:08X} ")?;
                }
                writeln!(out)?;
            }
            out.flush()?;
        }

        info!(frames = self.frames_written, "Frame sink finished");
        Ok(crcs)
    }
}

/// CRC32 of one frame's planes for every seed.
#[must_use]
pub fn frame_crc(frame: &DecodedFrame, seeds: &[u32]) -> Vec<u32> {
    seeds
        .iter()
        .map(|&seed| {
            let mut hasher = crc32fast::Hasher::new_with_initial(seed);
            for plane in &frame.planes {
                hasher.update(plane);
            }
            hasher.finalize()
        })
        .collect()
}

fn y4m_colorspace(chroma: ChromaSubsampling, bit_depth: u32) -> String {
    let high = bit_depth > 8;
    match (chroma, high) {
        (ChromaSubsampling::Yuv420, false) => "420jpeg".into(),
        (ChromaSubsampling::Yuv420, true) => format!("420p{bit_depth}"),
        (ChromaSubsampling::Yuv422, false) => "422".into(),
        (ChromaSubsampling::Yuv422, true) => format!("422p{bit_depth}"),
        (ChromaSubsampling::Yuv444, false) => "444".into(),
        (ChromaSubsampling::Yuv444, true) => format!("444p{bit_depth}"),
        (ChromaSubsampling::Monochrome, false) => "mono".into(),
        (ChromaSubsampling::Monochrome, true) => format!("mono{bit_depth}"),
    }
}
