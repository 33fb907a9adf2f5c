use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

/// Which render backend a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// An already-installed image viewer process, navigated by signals.
    External,
    /// In-process GPU texture renderer.
    Accelerated,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::External
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlOptions {
    /// Upserts accumulated before the store commits a batch.
    pub batch_size: usize,
    /// Accepted file extensions (lowercase, without dot).
    pub extensions: Vec<String>,
    /// Follow symbolic links while walking roots.
    pub follow_links: bool,
    /// Skip dot-directories below each root.
    pub skip_hidden: bool,
}

impl CrawlOptions {
    const fn default_batch_size() -> usize {
        1500
    }

    fn default_extensions() -> Vec<String> {
        ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect()
    }

    fn validate(&mut self) -> Result<()> {
        ensure!(self.batch_size > 0, "crawl.batch-size must be greater than zero");
        self.extensions = normalize_extensions(&self.extensions);
        ensure!(
            !self.extensions.is_empty(),
            "crawl.extensions must list at least one extension"
        );
        Ok(())
    }
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            extensions: Self::default_extensions(),
            follow_links: true,
            skip_hidden: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BufferOptions {
    /// Slots kept on each side of the current position.
    pub window_radius: usize,
    /// Upper bound on resident decoded bytes.
    pub memory_budget: u64,
    /// Files at least this large are decoded thumbnail-first.
    pub thumbnail_threshold_bytes: u64,
    /// Extensions always decoded thumbnail-first, whatever their size.
    pub large_formats: Vec<String>,
    /// Longest edge of a thumbnail-tier frame.
    pub thumbnail_max_dimension: u32,
    /// Maximum number of concurrent decodes.
    pub max_concurrent_decodes: usize,
    /// Generated thumbnails are kept here and recorded in the index. `null` disables.
    pub thumbnail_cache_dir: Option<PathBuf>,
}

impl BufferOptions {
    const fn default_memory_budget() -> u64 {
        512 * 1024 * 1024
    }

    const fn default_thumbnail_threshold() -> u64 {
        16 * 1024 * 1024
    }

    fn default_large_formats() -> Vec<String> {
        ["tif", "tiff"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect()
    }

    fn default_thumbnail_cache_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("draw-this").join("thumbnails"))
    }

    fn validate(&mut self) -> Result<()> {
        ensure!(
            self.memory_budget > 0,
            "buffer.memory-budget must be greater than zero"
        );
        ensure!(
            self.thumbnail_max_dimension > 0,
            "buffer.thumbnail-max-dimension must be greater than zero"
        );
        ensure!(
            self.max_concurrent_decodes > 0,
            "buffer.max-concurrent-decodes must be greater than zero"
        );
        self.large_formats = normalize_extensions(&self.large_formats);
        Ok(())
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            window_radius: 3,
            memory_budget: Self::default_memory_budget(),
            thumbnail_threshold_bytes: Self::default_thumbnail_threshold(),
            large_formats: Self::default_large_formats(),
            thumbnail_max_dimension: 512,
            max_concurrent_decodes: 4,
            thumbnail_cache_dir: Self::default_thumbnail_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BusOptions {
    /// Queue capacity of every subscriber.
    pub capacity: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionOptions {
    /// Time each image stays on screen. `None` means manual navigation only.
    #[serde(with = "humantime_serde")]
    pub timer: Option<Duration>,
    pub backend: BackendKind,
    /// Optional deterministic seed for the playback permutation.
    pub shuffle_seed: Option<u64>,
    /// How long the controller waits for `backend_ready`.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timer: Some(Duration::from_secs(60)),
            backend: BackendKind::default(),
            shuffle_seed: None,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ViewerOptions {
    /// External viewer executable.
    pub command: PathBuf,
    /// Extra arguments placed before the generated `--filelist`.
    pub args: Vec<String>,
    /// Directory for generated filelists. Defaults to the system temp dir.
    pub filelist_dir: Option<PathBuf>,
    /// Render target size of the accelerated backend.
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            command: PathBuf::from("feh"),
            args: vec!["-Z.".into(), "-B".into(), "black".into()],
            filelist_dir: None,
            canvas_width: 1920,
            canvas_height: 1080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// SQLite index location.
    pub database_path: PathBuf,
    pub crawl: CrawlOptions,
    pub buffer: BufferOptions,
    pub bus: BusOptions,
    pub session: SessionOptions,
    pub viewer: ViewerOptions,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(mut self) -> Result<Self> {
        self.crawl.validate().context("invalid crawl configuration")?;
        self.buffer
            .validate()
            .context("invalid buffer configuration")?;
        ensure!(self.bus.capacity > 0, "bus.capacity must be greater than zero");
        if let Some(timer) = self.session.timer {
            ensure!(!timer.is_zero(), "session.timer must be positive when set");
        }
        ensure!(
            !self.session.ready_timeout.is_zero(),
            "session.ready-timeout must be positive"
        );
        ensure!(
            self.viewer.canvas_width > 0 && self.viewer.canvas_height > 0,
            "viewer canvas dimensions must be positive"
        );
        Ok(self)
    }

    fn default_database_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("draw-this")
            .join("image_paths.db")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            database_path: Self::default_database_path(),
            crawl: CrawlOptions::default(),
            buffer: BufferOptions::default(),
            bus: BusOptions::default(),
            session: SessionOptions::default(),
            viewer: ViewerOptions::default(),
        }
    }
}

fn normalize_extensions(exts: &[String]) -> Vec<String> {
    let mut out: Vec<String> = exts
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
