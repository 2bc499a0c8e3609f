use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DropError, DropResult};
use crate::markup::Dimension;

pub const DEFAULT_AUTO_WIDTH: u32 = 340;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PanelCommand {
    InsertImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleType {
    #[default]
    Auto,
    Custom,
}

/// The single message a confirmed panel hands to the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelMessage {
    pub command: PanelCommand,
    pub image_src: Option<String>,
    pub image_uri: Option<String>,
    pub file_name: Option<String>,
    #[serde(default)]
    pub width: Dimension,
    #[serde(default)]
    pub height: Dimension,
    #[serde(default)]
    pub scale_type: ScaleType,
    #[serde(default)]
    pub center_image: bool,
    #[serde(default)]
    pub round_corners: bool,
    #[serde(default)]
    pub image_title: String,
    #[serde(default)]
    pub add_image_title: bool,
    #[serde(default)]
    pub is_resize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelMode {
    Upload,
    Resize { image_path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelState {
    Idle,
    Previewing,
    Cropping,
    Confirmed,
    Closed,
}

/// Crop rectangle in source pixels, written `x,y,width,height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FromStr for CropRect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u32> = s
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| format!("crop must be x,y,width,height in pixels, got {s:?}"))?;
        match parts.as_slice() {
            [x, y, width, height] => Ok(CropRect {
                x: *x,
                y: *y,
                width: *width,
                height: *height,
            }),
            _ => Err(format!("crop must have four values, got {s:?}")),
        }
    }
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

#[derive(Debug, Clone)]
struct Picked {
    bytes: Vec<u8>,
    mime: &'static str,
}

#[derive(Debug, Clone)]
pub struct PanelController {
    mode: PanelMode,
    state: PanelState,
    picked: Option<Picked>,
    file_name: Option<String>,
    original: Option<(u32, u32)>,
    scale_type: ScaleType,
    width: Dimension,
    height: Dimension,
    proportional: bool,
    center: bool,
    round_corners: bool,
    add_caption: bool,
    caption: String,
    auto_width: u32,
}

impl PanelController {
    pub fn upload(auto_width: u32) -> Self {
        Self::with_mode(PanelMode::Upload, PanelState::Idle, auto_width)
    }

    /// Opens on an existing image; its size seeds the aspect ratio.
    pub fn resize(image_path: &Path, auto_width: u32) -> Self {
        let mut panel = Self::with_mode(
            PanelMode::Resize {
                image_path: image_path.to_path_buf(),
            },
            PanelState::Previewing,
            auto_width,
        );
        match image::image_dimensions(image_path) {
            Ok(dims) => panel.original = Some(dims),
            Err(err) => warn!(path = %image_path.display(), "could not read image size: {err}"),
        }
        panel
    }

    fn with_mode(mode: PanelMode, state: PanelState, auto_width: u32) -> Self {
        Self {
            mode,
            state,
            picked: None,
            file_name: None,
            original: None,
            scale_type: ScaleType::Auto,
            width: Dimension::Auto,
            height: Dimension::Auto,
            proportional: true,
            center: true,
            round_corners: true,
            add_caption: false,
            caption: String::new(),
            auto_width,
        }
    }

    pub fn state(&self) -> PanelState {
        self.state
    }

    pub fn original_size(&self) -> Option<(u32, u32)> {
        self.original
    }

    pub fn size_inputs(&self) -> (Dimension, Dimension) {
        (self.width, self.height)
    }

    fn aspect_ratio(&self) -> Option<f64> {
        match self.original {
            Some((w, h)) if w > 0 && h > 0 => Some(f64::from(w) / f64::from(h)),
            _ => None,
        }
    }

    fn ensure_open(&self) -> DropResult<()> {
        match self.state {
            PanelState::Confirmed | PanelState::Closed => {
                Err(DropError::Panel("the panel is already closed".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Chooses (or drops) a file from disk.
    pub fn load_file(&mut self, path: &Path) -> DropResult<()> {
        let bytes = fs::read(path).map_err(|_| DropError::ImageNotFound(path.to_path_buf()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);
        self.load_bytes(name, bytes)
    }

    pub fn load_bytes(&mut self, file_name: Option<String>, bytes: Vec<u8>) -> DropResult<()> {
        self.ensure_open()?;
        if self.mode != PanelMode::Upload {
            return Err(DropError::Panel(
                "a new file can only be chosen when uploading".to_string(),
            ));
        }
        let format = image::guess_format(&bytes)?;
        self.original = probe_dimensions(&bytes);
        debug!(name = ?file_name, size = ?self.original, "previewing image");
        self.picked = Some(Picked {
            bytes,
            mime: format.to_mime_type(),
        });
        self.file_name = file_name;
        self.state = PanelState::Previewing;
        self.refresh_custom_inputs();
        Ok(())
    }

    pub fn start_crop(&mut self) -> DropResult<()> {
        self.ensure_open()?;
        if self.picked.is_none() {
            return Err(DropError::Panel(
                "cropping needs an uploaded image".to_string(),
            ));
        }
        self.state = PanelState::Cropping;
        Ok(())
    }

    /// Replaces the working image with the cropped region, re-encoded as PNG.
    pub fn finish_crop(&mut self, rect: CropRect) -> DropResult<()> {
        if self.state != PanelState::Cropping {
            return Err(DropError::Panel("cropping has not been started".to_string()));
        }
        let picked = self
            .picked
            .as_ref()
            .ok_or_else(|| DropError::Panel("cropping needs an uploaded image".to_string()))?;

        let img = image::load_from_memory(&picked.bytes)?;
        let (img_w, img_h) = img.dimensions();
        let x = rect.x.min(img_w);
        let y = rect.y.min(img_h);
        let w = rect.width.min(img_w - x);
        let h = rect.height.min(img_h - y);
        if w == 0 || h == 0 {
            return Err(DropError::Panel(format!(
                "crop {rect} is empty for a {img_w}x{img_h} image"
            )));
        }

        let mut out = Cursor::new(Vec::new());
        img.crop_imm(x, y, w, h).write_to(&mut out, ImageFormat::Png)?;
        debug!(x, y, w, h, "cropped image");

        self.picked = Some(Picked {
            bytes: out.into_inner(),
            mime: ImageFormat::Png.to_mime_type(),
        });
        self.original = Some((w, h));
        self.state = PanelState::Previewing;
        self.refresh_custom_inputs();
        Ok(())
    }

    pub fn set_scale_type(&mut self, scale_type: ScaleType) {
        self.scale_type = scale_type;
        if scale_type == ScaleType::Auto {
            self.width = Dimension::Auto;
            self.height = Dimension::Auto;
        }
        self.refresh_custom_inputs();
    }

    pub fn set_proportional(&mut self, on: bool) {
        self.proportional = on;
        if let (true, Dimension::Px(w), Some(ratio)) = (on, self.width, self.aspect_ratio()) {
            self.height = Dimension::from_f64(f64::from(w) / ratio);
        }
    }

    pub fn set_width(&mut self, width: Dimension) {
        self.width = width;
        if let (true, Dimension::Px(w), Some(ratio)) = (self.proportional, width, self.aspect_ratio())
        {
            self.height = Dimension::from_f64(f64::from(w) / ratio);
        }
    }

    pub fn set_height(&mut self, height: Dimension) {
        self.height = height;
        if let (true, Dimension::Px(h), Some(ratio)) =
            (self.proportional, height, self.aspect_ratio())
        {
            self.width = Dimension::from_f64(f64::from(h) * ratio);
        }
    }

    pub fn set_center(&mut self, on: bool) {
        self.center = on;
    }

    pub fn set_round_corners(&mut self, on: bool) {
        self.round_corners = on;
    }

    pub fn set_caption(&mut self, caption: Option<String>) {
        self.add_caption = caption.is_some();
        self.caption = caption.unwrap_or_default();
    }

    /// Custom mode mirrors the original size into both fields whenever the
    /// picture changes.
    fn refresh_custom_inputs(&mut self) {
        if self.scale_type != ScaleType::Custom {
            return;
        }
        match self.original {
            Some((w, h)) => {
                self.width = Dimension::Px(w);
                self.height = Dimension::Px(h);
            }
            None => {
                self.width = Dimension::Auto;
                self.height = Dimension::Auto;
            }
        }
    }

    fn chosen_size(&self) -> (Dimension, Dimension) {
        match self.scale_type {
            ScaleType::Custom => (self.width, self.height),
            ScaleType::Auto => {
                let height = match self.original {
                    Some((w, h)) if w > 0 => {
                        Dimension::from_f64(f64::from(h) / f64::from(w) * f64::from(self.auto_width))
                    }
                    _ => Dimension::Auto,
                };
                (Dimension::Px(self.auto_width), height)
            }
        }
    }

    /// Emits the one outbound message. Nothing is emitted, and the panel stays
    /// open, when an upload has no image yet.
    pub fn confirm(&mut self) -> DropResult<PanelMessage> {
        self.ensure_open()?;
        if self.mode == PanelMode::Upload && self.picked.is_none() {
            return Err(DropError::NoImageSelected);
        }
        if self.state == PanelState::Cropping {
            debug!("confirming with an unfinished crop; keeping the current image");
            self.state = PanelState::Previewing;
        }

        let (width, height) = self.chosen_size();
        let (image_src, image_uri, is_resize) = match &self.mode {
            PanelMode::Upload => (self.picked.as_ref().map(Picked::data_uri), None, false),
            PanelMode::Resize { image_path } => {
                (None, Some(image_path.to_string_lossy().into_owned()), true)
            }
        };
        let image_title = if self.add_caption {
            self.caption.trim().to_string()
        } else {
            String::new()
        };

        self.state = PanelState::Confirmed;
        Ok(PanelMessage {
            command: PanelCommand::InsertImage,
            image_src,
            image_uri,
            file_name: self.file_name.clone(),
            width,
            height,
            scale_type: self.scale_type,
            center_image: self.center,
            round_corners: self.round_corners,
            image_title,
            add_image_title: self.add_caption,
            is_resize,
        })
    }

    pub fn close(&mut self) {
        if self.state != PanelState::Confirmed {
            self.state = PanelState::Closed;
        }
    }
}

impl Picked {
    fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    match image::load_from_memory(bytes) {
        Ok(img) => Some(img.dimensions()),
        Err(err) => {
            warn!("could not decode image for preview: {err}");
            None
        }
    }
}
