use std::env;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::panel::DEFAULT_AUTO_WIDTH;

pub const WORKSPACE_ENV: &str = "NBIMG_WORKSPACE";
pub const AUTO_WIDTH_ENV: &str = "NBIMG_AUTO_WIDTH";
pub const LOG_ENV: &str = "NBIMG_LOG";

/// Settings shared by every command: CLI flags first, then the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workspace: Option<PathBuf>,
    pub auto_width: u32,
}

impl Settings {
    pub fn resolve(workspace_flag: Option<&Path>) -> Self {
        Self::from_lookup(workspace_flag, |key| env::var(key).ok())
    }

    fn from_lookup(workspace_flag: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace = workspace_flag.map(Path::to_path_buf).or_else(|| {
            lookup(WORKSPACE_ENV)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });

        let auto_width = match lookup(AUTO_WIDTH_ENV).filter(|v| !v.trim().is_empty()) {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(width) if width > 0 => width,
                _ => {
                    warn!("{AUTO_WIDTH_ENV}={raw:?} is not a positive integer; using {DEFAULT_AUTO_WIDTH}");
                    DEFAULT_AUTO_WIDTH
                }
            },
            None => DEFAULT_AUTO_WIDTH,
        };

        Self {
            workspace,
            auto_width,
        }
    }
}
