//! Installation home layout. Holds the home-scoped context and template
//! directories plus one working directory per dispatched run.

use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_DIRS: &[&str] = &["context", "templates", "inputs", "outputs"];

#[derive(Debug, thiserror::Error)]
pub enum HomeError {
    #[error("failed to resolve a home directory for reflow state")]
    HomeDirectoryUnavailable,
    #[error("failed to create home path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolves the installation home: `REFLOW_HOME`, else the user
    /// config directory (`$XDG_CONFIG_HOME` or `$HOME/.config`) plus
    /// `reflow`, bootstrapping the layout on first use.
    pub fn resolve() -> Result<Self, HomeError> {
        let root = if let Some(path) = env_path("REFLOW_HOME") {
            path
        } else if let Some(path) = env_path("XDG_CONFIG_HOME") {
            path.join("reflow")
        } else if let Some(path) = env_path("HOME") {
            path.join(".config").join("reflow")
        } else {
            return Err(HomeError::HomeDirectoryUnavailable);
        };

        let home = Self { root };
        home.init()?;
        Ok(home)
    }

    pub fn init(&self) -> Result<(), HomeError> {
        for dir in ["context", "templates", "outputs"] {
            create_dir(&self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn context_dir(&self) -> PathBuf {
        self.root.join("context")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    pub fn run_context_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("context")
    }

    pub fn run_templates_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("templates")
    }

    pub fn run_inputs_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("inputs").join("inputs.yaml")
    }

    pub fn run_outputs_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("outputs").join("outputs.json")
    }

    /// Creates the working directories for one run.
    pub fn init_run(&self, run_id: &str) -> Result<(), HomeError> {
        for dir in RUN_DIRS {
            create_dir(&self.run_dir(run_id).join(dir))?;
        }
        Ok(())
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn create_dir(path: &Path) -> Result<(), HomeError> {
    fs::create_dir_all(path).map_err(|source| HomeError::CreateDir {
        path: path.display().to_string(),
        source,
    })
}
