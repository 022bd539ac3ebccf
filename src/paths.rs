use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/// Application paths following OS conventions
#[derive(Clone, Debug)]
pub struct AppPaths {
    /// Configuration directory (config.toml)
    pub config: PathBuf,
    /// Data directory, one subdirectory per leaf controller
    pub data: PathBuf,
    /// Cache directory (logs)
    pub cache: PathBuf,
}

impl AppPaths {
    /// Resolve OS-specific paths for AudioWorker
    ///
    /// # Platform Paths
    ///
    /// ## Linux
    /// - Config: `~/.config/AudioWorker/`
    /// - Data: `~/.local/share/AudioWorker/` → Playback/, Record/, VoIP/
    /// - Cache: `~/.cache/AudioWorker/` → logs/
    ///
    /// ## macOS
    /// - Config: `~/Library/Preferences/AudioWorker/`
    /// - Data: `~/Library/Application Support/AudioWorker/`
    /// - Cache: `~/Library/Caches/AudioWorker/`
    ///
    /// ## Windows
    /// - Config: `%APPDATA%\AudioWorker\config\`
    /// - Data: `%LOCALAPPDATA%\AudioWorker\`
    /// - Cache: `%LOCALAPPDATA%\AudioWorker\Cache\`
    pub fn new() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "LotusEmberLabs", "AudioWorker")
            .context("Failed to determine project directories")?;

        Ok(Self {
            config: proj_dirs.config_dir().to_path_buf(),
            data: proj_dirs.data_dir().to_path_buf(),
            cache: proj_dirs.cache_dir().to_path_buf(),
        })
    }

    /// Everything under one root; used by `--home` and tests
    pub fn under(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
            cache: root.join("cache"),
        }
    }

    /// Create all necessary directories with subdirectories
    pub fn ensure_directories(&self, controllers: &[&str]) -> Result<()> {
        fs::create_dir_all(&self.config).context("Failed to create config directory")?;

        fs::create_dir_all(&self.data).context("Failed to create data directory")?;
        for name in controllers {
            let dir = self.controller_dir(name);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        fs::create_dir_all(self.logs_dir()).context("Failed to create logs directory")?;

        log::info!("Application directories initialized");
        log::debug!("  Config: {}", self.config.display());
        log::debug!("  Data:   {}", self.data.display());
        log::debug!("  Cache:  {}", self.cache.display());

        Ok(())
    }

    /// Get path to config file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Working directory of one leaf controller
    pub fn controller_dir(&self, name: &str) -> PathBuf {
        self.data.join(name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.cache.join("logs")
    }
}
