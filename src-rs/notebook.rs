use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::markup::has_image;
use crate::writer::CellDocument;

/// An `.ipynb` file held as raw JSON so untouched fields survive a save.
#[derive(Debug, Clone)]
pub struct Notebook {
    path: PathBuf,
    raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Markdown,
    Code,
    Raw,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellStatus {
    pub index: usize,
    pub kind: CellKind,
    pub affordances: Vec<&'static str>,
}

impl Notebook {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read notebook: {}", path.display()))?;
        let raw = Self::parse(&raw)
            .with_context(|| format!("invalid notebook JSON: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            raw,
        })
    }

    fn parse(raw: &str) -> Result<Value> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.get("cells").is_some_and(Value::is_array) {
            bail!("missing \"cells\" array");
        }
        Ok(value)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        let mut out = to_nbformat_json(&self.raw)?;
        out.push('\n');
        fs::write(&self.path, out)
            .with_context(|| format!("failed to write notebook: {}", self.path.display()))
    }

    fn cells(&self) -> &[Value] {
        self.raw
            .get("cells")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn cell_count(&self) -> usize {
        self.cells().len()
    }

    pub fn cell_text(&self, index: usize) -> Option<String> {
        self.cells().get(index).map(|cell| source_text(cell.get("source")))
    }

    /// A writable handle on a markdown cell.
    pub fn markup_cell(&mut self, index: usize) -> Result<MarkupCell<'_>> {
        let count = self.cell_count();
        let cell = self
            .raw
            .get_mut("cells")
            .and_then(Value::as_array_mut)
            .and_then(|cells| cells.get_mut(index))
            .ok_or_else(|| anyhow!("cell {index} is out of range ({count} cells)"))?;
        if kind_of(cell) != CellKind::Markdown {
            bail!("cell {index} is not a markdown cell");
        }
        let cell = cell
            .as_object_mut()
            .ok_or_else(|| anyhow!("cell {index} is not a JSON object"))?;
        Ok(MarkupCell { cell })
    }

    /// Upload is offered on every markdown cell, resize only where an image
    /// tag already exists.
    pub fn status(&self) -> Vec<CellStatus> {
        self.cells()
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let kind = kind_of(cell);
                let mut affordances = Vec::new();
                if kind == CellKind::Markdown {
                    if has_image(&source_text(cell.get("source"))) {
                        affordances.push("resize-image");
                    }
                    affordances.push("upload-image");
                }
                CellStatus {
                    index,
                    kind,
                    affordances,
                }
            })
            .collect()
    }
}

pub struct MarkupCell<'a> {
    cell: &'a mut Map<String, Value>,
}

impl CellDocument for MarkupCell<'_> {
    fn text(&self) -> String {
        source_text(self.cell.get("source"))
    }

    fn replace_all(&mut self, text: String) {
        let as_lines = matches!(self.cell.get("source"), Some(Value::Array(_)) | None);
        let source = if as_lines {
            Value::Array(
                text.split_inclusive('\n')
                    .map(|line| Value::String(line.to_string()))
                    .collect(),
            )
        } else {
            Value::String(text)
        };
        self.cell.insert("source".to_string(), source);
    }
}

fn kind_of(cell: &Value) -> CellKind {
    match cell.get("cell_type").and_then(Value::as_str) {
        Some("markdown") => CellKind::Markdown,
        Some("code") => CellKind::Code,
        _ => CellKind::Raw,
    }
}

fn source_text(source: Option<&Value>) -> String {
    match source {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(lines)) => lines.iter().filter_map(Value::as_str).collect(),
        _ => String::new(),
    }
}

/// nbformat writes JSON with a one-space indent.
fn to_nbformat_json(value: &Value) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8(buf)?)
}
