mod config;
mod error;
mod markup;
mod notebook;
mod panel;
mod session;
mod writer;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Settings, LOG_ENV};
use crate::error::DropError;
use crate::markup::{image_sources, Dimension};
use crate::notebook::Notebook;
use crate::panel::{CropRect, PanelController, PanelMessage, ScaleType};
use crate::session::{CellRef, Session};
use crate::writer::{MarkupWriter, WriteOutcome, WriteRequest};

#[derive(Parser, Debug)]
#[command(
    name = "nb-image-drop",
    version,
    about = "Insert, crop, and resize images in Jupyter notebook markdown cells"
)]
struct Cli {
    /// Project root that holds the images/ folder (default: $NBIMG_WORKSPACE)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Pick an image, optionally crop it, and append it to a markdown cell
    Upload(UploadArgs),
    /// Rewrite the tag of an image already embedded in a markdown cell
    Resize(ResizeArgs),
    /// Find the images in a cell, choose one, and resize it
    #[command(name = "resize-cell")]
    ResizeCell(ResizeCellArgs),
    /// Apply a panel message (insertImage JSON) to the focused cell
    Apply(ApplyArgs),
    /// Show upload/resize affordances for each cell
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Notebook (.ipynb) path
    notebook: PathBuf,
    /// Target markdown cell index (0-based)
    #[arg(long)]
    cell: Option<usize>,
    /// Image file to insert
    #[arg(long)]
    image: Option<PathBuf>,
    /// Crop region before inserting: x,y,width,height in pixels
    #[arg(long)]
    crop: Option<CropRect>,
    #[command(flatten)]
    options: PanelOptions,
}

#[derive(Args, Debug)]
struct ResizeArgs {
    /// Notebook (.ipynb) path
    notebook: PathBuf,
    /// Target markdown cell index (0-based)
    #[arg(long)]
    cell: Option<usize>,
    /// Existing image, absolute or relative to the workspace
    #[arg(long)]
    image: PathBuf,
    #[command(flatten)]
    options: PanelOptions,
}

#[derive(Args, Debug)]
struct ResizeCellArgs {
    /// Notebook (.ipynb) path
    notebook: PathBuf,
    /// Target markdown cell index (0-based)
    #[arg(long)]
    cell: usize,
    /// src of the image to resize when the cell holds several
    #[arg(long)]
    pick: Option<String>,
    #[command(flatten)]
    options: PanelOptions,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// Notebook (.ipynb) path
    notebook: PathBuf,
    /// Focused markdown cell index (0-based)
    #[arg(long)]
    cell: Option<usize>,
    /// Panel message JSON file path (or - for stdin)
    #[arg(long)]
    message: String,
    /// Print the write report JSON to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Notebook (.ipynb) path
    notebook: PathBuf,
}

#[derive(Args, Debug)]
struct PanelOptions {
    /// Custom width in px or "auto"; switches to custom sizing
    #[arg(long)]
    width: Option<Dimension>,
    /// Custom height in px or "auto"; switches to custom sizing
    #[arg(long)]
    height: Option<Dimension>,
    /// Do not derive the missing dimension from the aspect ratio
    #[arg(long, action = ArgAction::SetTrue)]
    no_keep_ratio: bool,
    /// Do not center the image
    #[arg(long, action = ArgAction::SetTrue)]
    no_center: bool,
    /// Do not round the image corners
    #[arg(long, action = ArgAction::SetTrue)]
    no_round: bool,
    /// Caption shown centered below the image
    #[arg(long)]
    caption: Option<String>,
    /// Print the write report JSON to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(cli.workspace.as_deref());
    let mut session = Session::new();
    debug!(?settings, "resolved settings");

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Upload(args) => command_upload(&settings, &session, args),
        Commands::Resize(args) => command_resize(&settings, &session, args),
        Commands::ResizeCell(args) => command_resize_cell(&settings, args),
        Commands::Apply(args) => command_apply(&settings, &mut session, args),
        Commands::Status(args) => command_status(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "upload",
            "description": "Open the upload panel: pick, crop, size, and insert an image."
        }),
        json!({
            "name": "resize",
            "description": "Open the resize panel for an image already in a cell."
        }),
        json!({
            "name": "resize-cell",
            "description": "Scan a cell for images, choose one, and resize it."
        }),
        json!({
            "name": "apply",
            "description": "Apply an insertImage panel message to the focused cell."
        }),
        json!({
            "name": "status",
            "description": "List upload/resize affordances per markdown cell."
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_upload(settings: &Settings, session: &Session, args: UploadArgs) -> Result<()> {
    let target = session.resolve_target(explicit_cell(&args.notebook, args.cell))?;

    let mut panel = PanelController::upload(settings.auto_width);
    if let Some(image) = &args.image {
        panel
            .load_file(image)
            .with_context(|| format!("failed to open image: {}", image.display()))?;
    }
    if let Some(rect) = args.crop {
        panel.start_crop()?;
        panel.finish_crop(rect)?;
    }
    apply_panel_options(&mut panel, &args.options);

    let message = match panel.confirm() {
        Ok(message) => message,
        Err(err) => {
            panel.close();
            return Err(err.into());
        }
    };
    debug!(
        state = ?panel.state(),
        original = ?panel.original_size(),
        inputs = ?panel.size_inputs(),
        "upload panel confirmed"
    );
    let outcome = write_to_cell(settings, &target, WriteRequest::try_from(message)?)?;
    report(&target, &outcome, args.options.json)
}

fn command_resize(settings: &Settings, session: &Session, args: ResizeArgs) -> Result<()> {
    let target = session.resolve_target(explicit_cell(&args.notebook, args.cell))?;
    let image_path = resolve_image_path(settings, &args.image);
    resize_with_panel(settings, &target, &image_path, &args.options)
}

fn command_resize_cell(settings: &Settings, args: ResizeCellArgs) -> Result<()> {
    let target = CellRef::new(&args.notebook, args.cell);
    let notebook = Notebook::load(&args.notebook)?;
    let text = notebook
        .cell_text(args.cell)
        .with_context(|| format!("cell {} is out of range", args.cell))?;

    let sources = image_sources(&text);
    if sources.is_empty() {
        println!("No images found in this cell.");
        return Ok(());
    }

    let chosen = match (&args.pick, sources.len()) {
        (Some(pick), _) => {
            if !sources.contains(pick) {
                bail!(
                    "image {pick:?} is not in cell {}; found: {}",
                    args.cell,
                    sources.join(", ")
                );
            }
            pick.clone()
        }
        (None, 1) => sources[0].clone(),
        (None, _) => match prompt_choice(&sources)? {
            Some(choice) => choice,
            None => return Ok(()),
        },
    };

    let root = settings.workspace.as_deref().ok_or(DropError::NoWorkspace)?;
    let image_path = root.join(&chosen);
    let meta = fs::metadata(&image_path).map_err(|_| DropError::ImageNotFound(image_path.clone()))?;
    if !meta.is_file() {
        return Err(DropError::NotAFile(image_path).into());
    }

    resize_with_panel(settings, &target, &image_path, &args.options)
}

fn command_apply(settings: &Settings, session: &mut Session, args: ApplyArgs) -> Result<()> {
    session.on_selection_changed(explicit_cell(&args.notebook, args.cell));
    let target = session.resolve_target(None)?;

    let message = load_message(&args.message)?;
    let request = WriteRequest::try_from(message)?;
    let outcome = write_to_cell(settings, &target, request)?;
    report(&target, &outcome, args.json)
}

fn command_status(args: StatusArgs) -> Result<()> {
    let notebook = Notebook::load(&args.notebook)?;
    let payload = json!({
        "notebook": notebook.path().display().to_string(),
        "cells": notebook.status(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn explicit_cell(notebook: &Path, cell: Option<usize>) -> Option<CellRef> {
    cell.map(|index| CellRef::new(notebook, index))
}

fn resize_with_panel(
    settings: &Settings,
    target: &CellRef,
    image_path: &Path,
    options: &PanelOptions,
) -> Result<()> {
    let mut panel = PanelController::resize(image_path, settings.auto_width);
    apply_panel_options(&mut panel, options);
    let message = panel.confirm()?;
    debug!(original = ?panel.original_size(), "resize panel confirmed");
    let outcome = write_to_cell(settings, target, WriteRequest::try_from(message)?)?;
    report(target, &outcome, options.json)
}

fn apply_panel_options(panel: &mut PanelController, opts: &PanelOptions) {
    if opts.width.is_some() || opts.height.is_some() {
        panel.set_scale_type(ScaleType::Custom);
        let both = opts.width.is_some() && opts.height.is_some();
        panel.set_proportional(!opts.no_keep_ratio && !both);
        if let Some(width) = opts.width {
            panel.set_width(width);
        }
        if let Some(height) = opts.height {
            panel.set_height(height);
        }
    }
    panel.set_center(!opts.no_center);
    panel.set_round_corners(!opts.no_round);
    panel.set_caption(opts.caption.clone());
}

/// Applies one request to the target cell and saves the notebook only when
/// the writer succeeded.
fn write_to_cell(settings: &Settings, target: &CellRef, request: WriteRequest) -> Result<WriteOutcome> {
    let mut notebook = Notebook::load(&target.notebook)?;
    let writer = MarkupWriter::new(settings.workspace.clone());
    let outcome = {
        let mut cell = notebook.markup_cell(target.index)?;
        writer.handle(request, Some(&mut cell))?
    };
    if outcome.changed {
        notebook.save()?;
        info!(
            notebook = %target.notebook.display(),
            cell = target.index,
            src = %outcome.relative_path,
            "notebook updated"
        );
    } else {
        info!(src = %outcome.relative_path, "image not referenced in cell; nothing to update");
    }
    Ok(outcome)
}

fn report(target: &CellRef, outcome: &WriteOutcome, as_json: bool) -> Result<()> {
    if as_json {
        let payload = json!({
            "mode": outcome.mode,
            "notebook": target.notebook.display().to_string(),
            "cell": target.index,
            "image_path": outcome.image_path.display().to_string(),
            "relative_path": outcome.relative_path,
            "markup": outcome.markup,
            "changed": outcome.changed,
            "applied_at": timestamp_iso(),
        });
        println!("{}", serde_json::to_string(&payload)?);
    } else {
        println!("{}", outcome.relative_path);
    }
    Ok(())
}

fn resolve_image_path(settings: &Settings, image: &Path) -> PathBuf {
    let raw = image.to_string_lossy();
    let image = Path::new(raw.strip_prefix("file://").unwrap_or(&raw));
    match (&settings.workspace, image.is_absolute()) {
        (Some(root), false) => root.join(image),
        _ => image.to_path_buf(),
    }
}

fn load_message(path: &str) -> Result<PanelMessage> {
    let raw = if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read panel message from stdin")?;
        buf
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read panel message file: {path}"))?
    };

    let value: Value = serde_json::from_str(&raw).context("invalid panel message JSON")?;
    if value.get("imageSrc").and_then(Value::as_str).is_none()
        && value.get("imageUri").and_then(Value::as_str).is_none()
    {
        return Err(DropError::MissingImageData.into());
    }
    serde_json::from_value(value).context("unsupported panel message")
}

/// Numbered list on stderr, answer on stdin. An empty answer cancels.
fn prompt_choice(choices: &[String]) -> Result<Option<String>> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        bail!(
            "cell holds {} images; choose one with --pick: {}",
            choices.len(),
            choices.join(", ")
        );
    }

    let mut stderr = io::stderr();
    writeln!(stderr, "Select an image to resize:")?;
    for (i, choice) in choices.iter().enumerate() {
        writeln!(stderr, "  {}) {choice}", i + 1)?;
    }
    write!(stderr, "> ")?;
    stderr.flush()?;

    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    parse_choice(&line, choices)
}

fn parse_choice(answer: &str, choices: &[String]) -> Result<Option<String>> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(None);
    }
    if let Some(found) = choices.iter().find(|c| c.as_str() == answer) {
        return Ok(Some(found.clone()));
    }
    match answer.parse::<usize>() {
        Ok(n) if (1..=choices.len()).contains(&n) => Ok(Some(choices[n - 1].clone())),
        _ => bail!("no image matches {answer:?}"),
    }
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn choices() -> Vec<String> {
        vec!["images/a.png".to_string(), "images/b.png".to_string()]
    }

    #[test]
    fn choice_accepts_number_or_src() {
        assert_eq!(
            parse_choice("2\n", &choices()).unwrap().as_deref(),
            Some("images/b.png")
        );
        assert_eq!(
            parse_choice("images/a.png", &choices()).unwrap().as_deref(),
            Some("images/a.png")
        );
        assert_eq!(parse_choice("  \n", &choices()).unwrap(), None);
        assert!(parse_choice("3", &choices()).is_err());
    }

    #[test]
    fn relative_images_resolve_against_workspace() {
        let settings = Settings {
            workspace: Some(PathBuf::from("/proj")),
            auto_width: 340,
        };
        assert_eq!(
            resolve_image_path(&settings, Path::new("images/a.png")),
            PathBuf::from("/proj/images/a.png")
        );
        assert_eq!(
            resolve_image_path(&settings, Path::new("file:///tmp/b.png")),
            PathBuf::from("/tmp/b.png")
        );
    }

    #[test]
    fn message_without_image_data_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("msg.json");
        fs::write(&path, r#"{"command":"insertImage","width":340,"height":200}"#).unwrap();
        let err = load_message(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no image data received"));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("msg.json");
        fs::write(&path, r#"{"command":"showError","imageSrc":"aGk="}"#).unwrap();
        assert!(load_message(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn command_targets_resolve_through_the_session() {
        let notebook = Path::new("lab.ipynb");
        let mut session = Session::new();
        assert!(session.resolve_target(explicit_cell(notebook, None)).is_err());

        session.on_selection_changed(explicit_cell(notebook, Some(1)));
        assert_eq!(
            session.resolve_target(explicit_cell(notebook, None)).unwrap(),
            CellRef::new(notebook, 1)
        );
        assert_eq!(
            session.resolve_target(explicit_cell(notebook, Some(3))).unwrap(),
            CellRef::new(notebook, 3)
        );
    }

    #[test]
    fn options_switch_to_custom_size() {
        let opts = PanelOptions {
            width: Some(Dimension::Px(100)),
            height: None,
            no_keep_ratio: false,
            no_center: true,
            no_round: false,
            caption: Some("Fig".to_string()),
            json: false,
        };
        let mut panel = PanelController::upload(340);
        apply_panel_options(&mut panel, &opts);
        assert_eq!(panel.size_inputs(), (Dimension::Px(100), Dimension::Auto));
    }
}
