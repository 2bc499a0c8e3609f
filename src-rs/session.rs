use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DropError, DropResult};

/// A cell identified by its notebook file and zero-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRef {
    pub notebook: PathBuf,
    pub index: usize,
}

impl CellRef {
    pub fn new(notebook: &Path, index: usize) -> Self {
        Self {
            notebook: notebook.to_path_buf(),
            index,
        }
    }
}

/// Process-scoped focus tracking. Selection notifications update the last
/// focused cell; an empty notification leaves it as it was.
#[derive(Debug, Default)]
pub struct Session {
    last_selected: Option<CellRef>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_selection_changed(&mut self, selected: Option<CellRef>) {
        if let Some(cell) = selected {
            debug!(notebook = %cell.notebook.display(), index = cell.index, "cell focused");
            self.last_selected = Some(cell);
        }
    }

    /// The explicit cell when given, otherwise the last focused one.
    pub fn resolve_target(&self, explicit: Option<CellRef>) -> DropResult<CellRef> {
        explicit
            .or_else(|| self.last_selected.clone())
            .ok_or(DropError::NoTargetCell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_cell_wins_over_focus() {
        let mut session = Session::new();
        session.on_selection_changed(Some(CellRef::new(Path::new("a.ipynb"), 1)));
        let target = session
            .resolve_target(Some(CellRef::new(Path::new("a.ipynb"), 4)))
            .unwrap();
        assert_eq!(target.index, 4);
    }

    #[test]
    fn falls_back_to_last_focused_cell() {
        let mut session = Session::new();
        session.on_selection_changed(Some(CellRef::new(Path::new("a.ipynb"), 2)));
        session.on_selection_changed(None);
        assert_eq!(session.resolve_target(None).unwrap().index, 2);
    }

    #[test]
    fn unset_focus_reports_missing_cell() {
        let mut session = Session::new();
        session.on_selection_changed(None);
        assert!(session.last_selected.is_none());
        assert!(matches!(session.resolve_target(None), Err(DropError::NoTargetCell)));
    }
}
