//! Frame-level media I/O for the detect stage.
//!
//! Images go through the `image` crate. Videos are streamed as raw `rgb24`
//! frames through `ffmpeg` child processes so the detect loop sees one frame
//! at a time, in order.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use ab_glyph::{FontArc, PxScale};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::models::detection::{Detection, DetectionSummary};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMeta {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[async_trait]
pub trait FrameReader: Send {
    /// Next decoded frame, or `None` at end of stream.
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError>;

    /// Flush and close the output file.
    async fn finish(self: Box<Self>) -> Result<(), MediaError>;
}

/// Video decode/encode collaborator.
#[async_trait]
pub trait VideoCodec: Send + Sync {
    async fn open(&self, path: &Path) -> Result<(VideoMeta, Box<dyn FrameReader>), MediaError>;

    async fn create(&self, path: &Path, meta: VideoMeta) -> Result<Box<dyn FrameWriter>, MediaError>;
}

/// Codec backed by the `ffprobe` and `ffmpeg` binaries on `PATH`.
#[derive(Debug, Default, Clone)]
pub struct FfmpegCodec;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001`.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den > 0.0 && num > 0.0).then(|| num / den)
        }
        None => rate.parse().ok().filter(|r: &f64| *r > 0.0),
    }
}

impl FfmpegCodec {
    async fn probe(path: &Path) -> Result<VideoMeta, MediaError> {
        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(MediaError::Probe(String::from_utf8_lossy(&output.stderr).to_string()));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| MediaError::Probe(e.to_string()))?;
        let stream = probe
            .streams
            .iter()
            .find(|s| s.codec_type == "video")
            .ok_or_else(|| MediaError::Probe("no video stream".to_string()))?;

        let (width, height) = match (stream.width, stream.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(MediaError::Probe("video stream has no dimensions".to_string())),
        };
        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(30.0);

        Ok(VideoMeta { width, height, fps })
    }
}

#[async_trait]
impl VideoCodec for FfmpegCodec {
    async fn open(&self, path: &Path) -> Result<(VideoMeta, Box<dyn FrameReader>), MediaError> {
        let meta = Self::probe(path).await?;
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Ffmpeg("failed to capture decoder stdout".to_string()))?;

        debug!(path = %path.display(), ?meta, "Opened video for decoding");
        let reader = FfmpegReader {
            child,
            stdout,
            width: meta.width,
            height: meta.height,
        };
        Ok((meta, Box::new(reader)))
    }

    async fn create(&self, path: &Path, meta: VideoMeta) -> Result<Box<dyn FrameWriter>, MediaError> {
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-y", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{}x{}", meta.width, meta.height)])
            .args(["-r", &format!("{:.3}", meta.fps)])
            .args(["-i", "-", "-c:v", "libx264", "-pix_fmt", "yuv420p", "-movflags", "+faststart"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MediaError::Ffmpeg("failed to capture encoder stdin".to_string()))?;

        Ok(Box::new(FfmpegWriter {
            child,
            stdin: Some(stdin),
            path: path.to_path_buf(),
        }))
    }
}

struct FfmpegReader {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

#[async_trait]
impl FrameReader for FfmpegReader {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        let mut buf = vec![0u8; rgb_frame_len(self.width, self.height)];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => RgbImage::from_raw(self.width, self.height, buf)
                .map(Some)
                .ok_or_else(|| MediaError::Ffmpeg("frame buffer size mismatch".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let status = self.child.wait().await?;
                if !status.success() {
                    warn!(code = ?status.code(), "Decoder exited with non-zero status");
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Bytes in one packed `rgb24` frame.
fn rgb_frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

struct FfmpegWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    path: PathBuf,
}

#[async_trait]
impl FrameWriter for FfmpegWriter {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MediaError::Ffmpeg("encoder already closed".to_string()))?;
        stdin.write_all(frame.as_raw()).await?;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), MediaError> {
        let FfmpegWriter { child, stdin, path } = *self;
        // Closing stdin signals end of stream to the encoder.
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(MediaError::Ffmpeg(format!(
                "encoding {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Decode an image file into RGB.
pub async fn load_image(path: &Path) -> Result<RgbImage, MediaError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::open(&path).map(|img| img.to_rgb8()))
        .await
        .map_err(|e| MediaError::Ffmpeg(format!("image decode task failed: {e}")))?
        .map_err(MediaError::Image)
}

/// Encode an RGB image to `path`; the format follows the extension.
pub async fn save_image(image: RgbImage, path: &Path) -> Result<(), MediaError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || image.save(&path))
        .await
        .map_err(|e| MediaError::Ffmpeg(format!("image encode task failed: {e}")))?
        .map_err(MediaError::Image)
}

/// Stable colour for a class id.
pub fn class_color(class_id: u32) -> Rgb<u8> {
    const PALETTE: [[u8; 3]; 8] = [
        [255, 56, 56],
        [255, 157, 151],
        [255, 112, 31],
        [255, 178, 29],
        [207, 210, 49],
        [72, 249, 10],
        [26, 147, 52],
        [0, 212, 187],
    ];
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

const CAPTION_SCALE: f32 = 14.0;
const BANNER_SCALE: f32 = 18.0;
const BANNER_COLOR: Rgb<u8> = Rgb([104, 31, 17]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Draws detection boxes, plus box captions and a count banner when a
/// font has been loaded. Without a font only the outlines are drawn.
#[derive(Clone, Debug, Default)]
pub struct Annotator {
    font: Option<FontArc>,
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a TrueType/OpenType font for captions.
    pub async fn with_font_file(path: &Path) -> Result<Self, MediaError> {
        let bytes = tokio::fs::read(path).await?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|e| MediaError::Font(format!("{}: {e}", path.display())))?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Outline each detection and caption it with `caption(det)`.
    pub fn draw<F>(&self, frame: &mut RgbImage, detections: &[Detection], caption: F)
    where
        F: Fn(&Detection) -> String,
    {
        annotate(frame, detections);
        let Some(font) = &self.font else {
            return;
        };
        for det in detections {
            draw_label(
                frame,
                font,
                &caption(det),
                det.bbox.x1.max(0.0) as i32,
                det.bbox.y1.max(0.0) as i32,
                CAPTION_SCALE,
                class_color(det.class_id),
            );
        }
    }

    /// Running per-class counts in the top-left corner.
    pub fn banner(&self, frame: &mut RgbImage, summary: &DetectionSummary) {
        let Some(font) = &self.font else {
            return;
        };
        let text = summary_label(summary);
        if !text.is_empty() {
            draw_label(frame, font, &text, 10, 30, BANNER_SCALE, BANNER_COLOR);
        }
    }
}

/// `"car: 1, person: 2"`
pub fn summary_label(summary: &DetectionSummary) -> String {
    summary
        .iter()
        .map(|(label, count)| format!("{label}: {}", count.count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Caption for a tracked box: `"<track_id>: <label>"`, or the label alone.
pub fn track_caption(label: &str, track_id: Option<u64>) -> String {
    match track_id {
        Some(id) => format!("{id}: {label}"),
        None => label.to_string(),
    }
}

/// Text on a filled background whose bottom-left corner sits at `(x, y)`.
fn draw_label(frame: &mut RgbImage, font: &FontArc, text: &str, x: i32, y: i32, scale: f32, background: Rgb<u8>) {
    if text.is_empty() {
        return;
    }
    let scale = PxScale::from(scale);
    let (w, h) = text_size(scale, font, text);
    let top = (y - h as i32 - 4).max(0);
    draw_filled_rect_mut(frame, Rect::at(x, top).of_size(w + 4, h + 4), background);
    draw_text_mut(frame, TEXT_COLOR, x + 2, top + 2, scale, font, text);
}

/// Outline every detection's box on the frame.
pub fn annotate(frame: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
        draw_rect(frame, det, class_color(det.class_id), 2);
    }
}

fn draw_rect(frame: &mut RgbImage, det: &Detection, color: Rgb<u8>, thickness: u32) {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let (x1, x2) = (clamp_x(det.bbox.x1), clamp_x(det.bbox.x2));
    let (y1, y2) = (clamp_y(det.bbox.y1), clamp_y(det.bbox.y2));
    if x2 < x1 || y2 < y1 {
        return;
    }

    for t in 0..thickness {
        for x in x1..=x2 {
            frame.put_pixel(x, (y1 + t).min(y2), color);
            frame.put_pixel(x, y2.saturating_sub(t).max(y1), color);
        }
        for y in y1..=y2 {
            frame.put_pixel((x1 + t).min(x2), y, color);
            frame.put_pixel(x2.saturating_sub(t).max(x1), y, color);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ffprobe failed: {0}")]
    Probe(String),

    #[error("ffmpeg failed: {0}")]
    Ffmpeg(String),

    #[error("Font error: {0}")]
    Font(String),
}
