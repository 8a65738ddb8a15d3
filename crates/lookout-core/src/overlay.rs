//! Overlay renderer: paints the live frame and the latest result.
//!
//! Runs at display rate on its own task, independent of the analysis tick.
//! Each pass reads the surface and the store and never touches the network,
//! so a slow backend cannot stall the video.

use crate::store::{ResultStore, StoreSnapshot};
use crate::types::BoundingBox;
use ab_glyph::{FontRef, PxScale};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use lookout_hw::{Frame, VideoSurface};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_RENDER_FPS: u32 = 30;

pub const IDENTIFIED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
pub const UNIDENTIFIED_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 12.0;
const LABEL_HEIGHT: u32 = 14;
const STATUS_SCALE: f32 = 13.0;
const STATUS_HEIGHT: u32 = 16;
const TEXT_PADDING: u32 = 2;

/// Faster render rates are capped to this.
pub const MAX_RENDER_FPS: u32 = 1000;
const MIN_RENDER_PERIOD: Duration = Duration::from_millis(1);

const FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();

/// The embedded label font. `None` only if the embedded file is corrupt,
/// in which case labels are drawn as bare bars.
fn label_font() -> Option<&'static FontRef<'static>> {
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_DATA) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::error!(error = %e, "embedded label font is invalid");
            None
        }
    })
    .as_ref()
}

/// Maps boxes from the analysed frame's pixel space to the display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleTransform {
    pub sx: f32,
    pub sy: f32,
}

impl ScaleTransform {
    pub const IDENTITY: Self = Self { sx: 1.0, sy: 1.0 };

    /// `sx = W'/W`, `sy = H'/H`. Identity while the native size is unknown.
    pub fn new(native: (u32, u32), display: (u32, u32)) -> Self {
        let (nw, nh) = native;
        let (dw, dh) = display;
        if nw == 0 || nh == 0 || dw == 0 || dh == 0 {
            return Self::IDENTITY;
        }
        Self {
            sx: dw as f32 / nw as f32,
            sy: dh as f32 / nh as f32,
        }
    }

    pub fn apply(&self, bbox: &BoundingBox) -> BoundingBox {
        if self.is_identity() {
            return *bbox;
        }
        bbox.scaled(self.sx, self.sy)
    }

    pub fn is_identity(&self) -> bool {
        self.sx == 1.0 && self.sy == 1.0
    }
}

/// Drawing surface the overlay paints onto.
pub trait Canvas {
    fn size(&self) -> (u32, u32);
    fn clear(&mut self);
    /// Draw `frame` stretched to the canvas.
    fn draw_video(&mut self, frame: &Frame);
    fn stroke_rect(&mut self, rect: &BoundingBox, color: Rgb<u8>);
    fn draw_label(&mut self, x: f32, y: f32, text: &str, color: Rgb<u8>);
    fn draw_status(&mut self, text: &str, color: Rgb<u8>);
}

/// Paint one overlay pass: video first, then boxes, labels and status.
pub fn paint<K: Canvas + ?Sized>(canvas: &mut K, frame: Option<&Frame>, snapshot: &StoreSnapshot) {
    canvas.clear();

    let native = match frame {
        Some(frame) if !frame.is_empty() => {
            canvas.draw_video(frame);
            (frame.width, frame.height)
        }
        _ => (0, 0),
    };
    let transform = ScaleTransform::new(native, canvas.size());

    if let Some(result) = &snapshot.latest {
        for face in result.faces() {
            let color = if face.is_identified() {
                IDENTIFIED_COLOR
            } else {
                UNIDENTIFIED_COLOR
            };
            let rect = transform.apply(&face.bbox);
            canvas.stroke_rect(&rect, color);
            canvas.draw_label(rect.x, rect.y, &face.label(), color);
        }

        let color = if result.is_positive() {
            IDENTIFIED_COLOR
        } else {
            UNIDENTIFIED_COLOR
        };
        canvas.draw_status(&result.summary(), color);
    } else if let Some(err) = &snapshot.last_error {
        canvas.draw_status(&format!("Analysis failed: {err}"), UNIDENTIFIED_COLOR);
    }
}

/// A label as it was placed on the canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLabel {
    pub x: f32,
    pub y: f32,
    pub text: String,
    pub color: Rgb<u8>,
}

/// [`Canvas`] backed by an in-memory RGB image.
///
/// Labels and the status line are rasterised onto coloured bars; their
/// text is also kept alongside for callers to read.
pub struct FrameCanvas {
    image: RgbImage,
    labels: Vec<RenderedLabel>,
    status: Option<RenderedLabel>,
}

impl FrameCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width.max(1), height.max(1)),
            labels: Vec::new(),
            status: None,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn labels(&self) -> &[RenderedLabel] {
        &self.labels
    }

    pub fn status(&self) -> Option<&RenderedLabel> {
        self.status.as_ref()
    }

    /// Write the current canvas to disk; format follows the extension.
    pub fn save(&self, path: &Path) -> Result<(), image::ImageError> {
        self.image.save(path)
    }

    /// Fill `width` x `height` at `(x, y)`, clipped to the canvas.
    fn fill(&mut self, x: i32, y: i32, width: u32, height: u32, color: Rgb<u8>) {
        if let Some(rect) = clipped_rect(x, y, width, height, self.image.dimensions()) {
            draw_filled_rect_mut(&mut self.image, rect, color);
        }
    }

    /// White text vertically centred in a bar of `height` whose top-left is `(x, y)`.
    fn put_text(&mut self, x: i32, y: i32, height: u32, scale: f32, text: &str) {
        let Some(font) = label_font() else {
            return;
        };
        let ty = y + (height as i32 - scale.round() as i32) / 2;
        draw_text_mut(
            &mut self.image,
            TEXT_COLOR,
            x + TEXT_PADDING as i32,
            ty,
            PxScale::from(scale),
            font,
            text,
        );
    }
}

/// Width of a bar that fits `text` at `scale` plus padding.
fn text_bar_width(scale: f32, text: &str) -> u32 {
    let glyphs = match label_font() {
        Some(font) => text_size(PxScale::from(scale), font, text).0,
        None => text.chars().count() as u32 * (scale / 2.0).round() as u32,
    };
    glyphs + 2 * TEXT_PADDING
}

/// `Rect` covering the on-canvas part of an area, if any.
fn clipped_rect(x: i32, y: i32, width: u32, height: u32, canvas: (u32, u32)) -> Option<Rect> {
    let x0 = i64::from(x).max(0);
    let y0 = i64::from(y).max(0);
    let x1 = (i64::from(x) + i64::from(width)).min(i64::from(canvas.0));
    let y1 = (i64::from(y) + i64::from(height)).min(i64::from(canvas.1));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Rect::at(x0 as i32, y0 as i32).of_size((x1 - x0) as u32, (y1 - y0) as u32))
}

impl Canvas for FrameCanvas {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = Rgb([0, 0, 0]);
        }
        self.labels.clear();
        self.status = None;
    }

    fn draw_video(&mut self, frame: &Frame) {
        let Some(src) = frame.to_rgb_image() else {
            tracing::warn!(?frame, "frame buffer does not match its dimensions");
            return;
        };
        let (w, h) = self.size();
        self.image = if src.dimensions() == (w, h) {
            src
        } else {
            imageops::resize(&src, w, h, FilterType::Triangle)
        };
    }

    fn stroke_rect(&mut self, rect: &BoundingBox, color: Rgb<u8>) {
        let x = rect.x.round() as i32;
        let y = rect.y.round() as i32;
        let w = rect.width.round().max(0.0) as u32;
        let h = rect.height.round().max(0.0) as u32;

        // Nested one-pixel outlines, outermost first.
        for inset in 0..BOX_THICKNESS {
            let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
            if iw == 0 || ih == 0 {
                break;
            }
            let outline = Rect::at(x + inset as i32, y + inset as i32).of_size(iw, ih);
            draw_hollow_rect_mut(&mut self.image, outline, color);
        }
    }

    fn draw_label(&mut self, x: f32, y: f32, text: &str, color: Rgb<u8>) {
        // Bar sits above the box, or inside it at the top edge.
        let left = x.round() as i32;
        let top = (y.round() as i32 - LABEL_HEIGHT as i32).max(0);
        let width = text_bar_width(LABEL_SCALE, text);
        self.fill(left, top, width, LABEL_HEIGHT, color);
        self.put_text(left, top, LABEL_HEIGHT, LABEL_SCALE, text);

        self.labels.push(RenderedLabel {
            x,
            y: top as f32,
            text: text.to_string(),
            color,
        });
    }

    fn draw_status(&mut self, text: &str, color: Rgb<u8>) {
        let (w, h) = self.image.dimensions();
        let top = h.saturating_sub(STATUS_HEIGHT) as i32;
        self.fill(0, top, w, STATUS_HEIGHT, color);
        self.put_text(0, top, STATUS_HEIGHT, STATUS_SCALE, text);
        self.status = Some(RenderedLabel {
            x: 0.0,
            y: top as f32,
            text: text.to_string(),
            color,
        });
    }
}

struct RenderRun {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Display-rate render loop over a shared [`Canvas`].
pub struct OverlayRenderer<K: Canvas + Send + 'static> {
    canvas: Arc<Mutex<K>>,
    fps: u32,
    frames: Arc<AtomicU64>,
    run: Option<RenderRun>,
}

impl<K: Canvas + Send + 'static> OverlayRenderer<K> {
    pub fn new(canvas: K, fps: u32) -> Self {
        Self {
            canvas: Arc::new(Mutex::new(canvas)),
            fps: fps.clamp(1, MAX_RENDER_FPS),
            frames: Arc::new(AtomicU64::new(0)),
            run: None,
        }
    }

    /// Start rendering `surface` and `store`, replacing any running loop.
    pub fn start(&mut self, surface: VideoSurface, store: ResultStore) {
        self.stop();

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let canvas = self.canvas.clone();
        let frames = self.frames.clone();
        let period = (Duration::from_secs(1) / self.fps).max(MIN_RENDER_PERIOD);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let closed = surface.closed();
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = &mut closed => {
                        tracing::debug!("camera closed; overlay renderer halted");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                let frame = surface.current_frame();
                let snapshot = store.snapshot();
                let mut canvas = canvas.lock().unwrap_or_else(PoisonError::into_inner);
                paint(&mut *canvas, frame.as_deref(), &snapshot);
                drop(canvas);
                frames.fetch_add(1, Ordering::Relaxed);
            }
        });

        self.run = Some(RenderRun {
            stop: stop_tx,
            task,
        });
        tracing::debug!(fps = self.fps, "overlay renderer started");
    }

    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            let _ = run.stop.send(());
            drop(run.task);
            tracing::debug!(frames = self.frames(), "overlay renderer stopped");
        }
    }

    /// False once stopped, or once the loop ended because the camera closed.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.task.is_finished())
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Passes painted since construction.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Run `f` against the canvas between render passes.
    pub fn with_canvas<R>(&self, f: impl FnOnce(&K) -> R) -> R {
        let canvas = self.canvas.lock().unwrap_or_else(PoisonError::into_inner);
        f(&canvas)
    }
}

impl<K: Canvas + Send + 'static> Drop for OverlayRenderer<K> {
    fn drop(&mut self) {
        self.stop();
    }
}
