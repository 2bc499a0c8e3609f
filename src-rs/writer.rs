use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{DropError, DropResult};
use crate::markup::{replace_image, Dimension, ImageMarkup};
use crate::panel::PanelMessage;

pub const IMAGES_DIR: &str = "images";
pub const DEFAULT_FILE_NAME: &str = "image.png";
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// A text document whose whole body is read and replaced at once.
pub trait CellDocument {
    fn text(&self) -> String;
    fn replace_all(&mut self, text: String);
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageInsertRequest {
    /// Base64 payload, optionally wrapped in a `data:` URI.
    pub image_data: String,
    pub file_name: Option<String>,
    pub width: Dimension,
    pub height: Dimension,
    pub center: bool,
    pub round_corners: bool,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpdateRequest {
    pub image_path: PathBuf,
    pub width: Dimension,
    pub height: Dimension,
    pub center: bool,
    pub round_corners: bool,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Insert(ImageInsertRequest),
    Update(ImageUpdateRequest),
}

impl TryFrom<PanelMessage> for WriteRequest {
    type Error = DropError;

    fn try_from(msg: PanelMessage) -> DropResult<Self> {
        let caption = if msg.add_image_title {
            Some(msg.image_title.trim().to_string()).filter(|t| !t.is_empty())
        } else {
            None
        };

        if msg.is_resize {
            let uri = msg.image_uri.ok_or(DropError::MissingImageData)?;
            return Ok(WriteRequest::Update(ImageUpdateRequest {
                image_path: path_from_uri(&uri),
                width: msg.width,
                height: msg.height,
                center: msg.center_image,
                round_corners: msg.round_corners,
                caption,
            }));
        }

        let image_data = msg
            .image_src
            .filter(|s| !s.trim().is_empty())
            .ok_or(DropError::MissingImageData)?;
        Ok(WriteRequest::Insert(ImageInsertRequest {
            image_data,
            file_name: msg.file_name.filter(|n| !n.trim().is_empty()),
            width: msg.width,
            height: msg.height,
            center: msg.center_image,
            round_corners: msg.round_corners,
            caption,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub mode: &'static str,
    pub image_path: PathBuf,
    pub relative_path: String,
    pub markup: String,
    pub changed: bool,
}

/// Turns insert/update requests into file writes and cell edits.
#[derive(Debug, Clone, Default)]
pub struct MarkupWriter {
    workspace: Option<PathBuf>,
}

impl MarkupWriter {
    pub fn new(workspace: Option<PathBuf>) -> Self {
        Self { workspace }
    }

    pub fn handle(
        &self,
        request: WriteRequest,
        cell: Option<&mut dyn CellDocument>,
    ) -> DropResult<WriteOutcome> {
        match request {
            WriteRequest::Insert(req) => self.insert(&req, cell),
            WriteRequest::Update(req) => self.update(&req, cell),
        }
    }

    pub fn insert(
        &self,
        req: &ImageInsertRequest,
        cell: Option<&mut dyn CellDocument>,
    ) -> DropResult<WriteOutcome> {
        let cell = cell.ok_or(DropError::NoTargetCell)?;
        let root = self.root()?;

        let images_dir = root.join(IMAGES_DIR);
        fs::create_dir_all(&images_dir).map_err(|source| DropError::Write {
            path: images_dir.clone(),
            source,
        })?;

        let target = allocate_file_name(&images_dir, req.file_name.as_deref())?;
        let bytes = decode_payload(&req.image_data)?;
        write_new_file(&target, &bytes)?;
        info!(path = %target.display(), bytes = bytes.len(), "stored image");

        let relative_path = relative_path(&root, &target);
        let markup = ImageMarkup {
            src: relative_path.clone(),
            width: req.width,
            height: req.height,
            center: req.center,
            round_corners: req.round_corners,
            caption: req.caption.clone(),
        }
        .render();

        let new_text = format!("{}\n{}", cell.text(), markup);
        cell.replace_all(new_text);

        Ok(WriteOutcome {
            mode: "insert",
            image_path: target,
            relative_path,
            markup,
            changed: true,
        })
    }

    pub fn update(
        &self,
        req: &ImageUpdateRequest,
        cell: Option<&mut dyn CellDocument>,
    ) -> DropResult<WriteOutcome> {
        let cell = cell.ok_or(DropError::NoTargetCell)?;
        let root = self.root()?;

        let candidate = if req.image_path.is_absolute() {
            req.image_path.clone()
        } else {
            root.join(&req.image_path)
        };
        let meta = fs::metadata(&candidate)
            .map_err(|_| DropError::ImageNotFound(candidate.clone()))?;
        if !meta.is_file() {
            return Err(DropError::NotAFile(candidate));
        }
        // Symlinks stay unresolved so the key matches the src already in the cell.
        let image_path = normalize(&candidate);

        let relative_path = relative_path(&root, &image_path);
        let markup = ImageMarkup {
            src: relative_path.clone(),
            width: req.width,
            height: req.height,
            center: req.center,
            round_corners: req.round_corners,
            caption: req.caption.clone(),
        }
        .render();

        let text = cell.text();
        let new_text = replace_image(&text, &relative_path, &markup);
        let changed = new_text != text;
        if changed {
            debug!(src = %relative_path, "replaced image tag");
        } else {
            debug!(src = %relative_path, "no matching image tag, cell left as is");
        }
        cell.replace_all(new_text);

        Ok(WriteOutcome {
            mode: "update",
            image_path,
            relative_path,
            markup,
            changed,
        })
    }

    fn root(&self) -> DropResult<PathBuf> {
        let root = self.workspace.as_deref().ok_or(DropError::NoWorkspace)?;
        match fs::canonicalize(root) {
            Ok(path) if path.is_dir() => Ok(path),
            _ => Err(DropError::NoWorkspace),
        }
    }
}

/// First free name in `dir`: the suggested name, then `stem_1.ext`,
/// `stem_2.ext`, and so on.
pub fn allocate_file_name(dir: &Path, suggested: Option<&str>) -> DropResult<PathBuf> {
    let sanitized = suggested
        .and_then(|s| s.rsplit(['/', '\\']).next())
        .map(|s| sanitize_file_name(s.trim()))
        .filter(|s| !s.is_empty() && s != "." && s != "..");
    let name = sanitized.as_deref().unwrap_or(DEFAULT_FILE_NAME);

    let first = dir.join(name);
    if !first.exists() {
        return Ok(first);
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = as_path
        .extension()
        .and_then(|s| s.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    for index in 1..MAX_NAME_ATTEMPTS {
        let candidate = dir.join(format!("{stem}_{index}{ext}"));
        if !candidate.exists() {
            debug!(name = %candidate.display(), taken = index, "allocated suffixed name");
            return Ok(candidate);
        }
    }
    Err(DropError::NoFreeFileName {
        base: name.to_string(),
        attempts: MAX_NAME_ATTEMPTS,
    })
}

/// Lowercases `input` and replaces anything outside `[a-z0-9._-]` with `_`,
/// so the name can sit inside a quoted `src` attribute as is.
pub fn sanitize_file_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

/// Strips a `data:...;base64,` prefix and decodes the rest.
pub fn decode_payload(data: &str) -> DropResult<Vec<u8>> {
    let body = match data.find(";base64,") {
        Some(idx) if data.starts_with("data:") => &data[idx + ";base64,".len()..],
        _ => data,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(DropError::MissingImageData);
    }
    Ok(STANDARD.decode(compact)?)
}

fn write_new_file(path: &Path, bytes: &[u8]) -> DropResult<()> {
    let to_write_error = |source| DropError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(to_write_error)?;
    file.write_all(bytes).map_err(to_write_error)?;
    Ok(())
}

/// `path` relative to `root` with forward slashes, walking up with `..` when
/// the path lies outside the root.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let root = normalize(root);
    let path = normalize(path);
    let root_parts: Vec<Component<'_>> = root.components().collect();
    let path_parts: Vec<Component<'_>> = path.components().collect();

    let shared = root_parts
        .iter()
        .zip(&path_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = Vec::new();
    for _ in shared..root_parts.len() {
        parts.push("..".to_string());
    }
    for comp in &path_parts[shared..] {
        parts.push(comp.as_os_str().to_string_lossy().into_owned());
    }
    parts.join("/").replace('\\', "/")
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn path_from_uri(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}
