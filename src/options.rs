//! Engine configuration (§6: Options).
//!
//! `Options` is a plain, validated struct handed to [`crate::engine::Engine::open`].
//! It plays the same role the teacher's `Cli`/`command` pair plays for its CLI: a
//! thin, explicitly-constructed value that downstream code can trust has already been
//! checked, rather than re-validating scattered primitives everywhere.

use std::path::PathBuf;
use std::sync::Arc;

use crate::env::{Env, OsEnv};
use crate::error::{Error, Result};

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 32768;
pub const DEFAULT_PAGE_SIZE: u32 = 8192;

pub const MIN_FRAME_COUNT: usize = 8;
pub const MAX_FRAME_COUNT: usize = 8192;

/// Log verbosity, mirrored 1:1 onto `log::LevelFilter` once options are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Trace,
}

/// Where log records are sent once a level above `Off` is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    #[default]
    Stderr,
    Stdout,
    File,
}

#[derive(Clone)]
pub struct Options {
    /// Page size in bytes; power of two, clamped to `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`.
    /// Ignored when opening an existing database (the on-disk header wins).
    pub page_size: u32,
    /// Cache budget in bytes; converted to a frame count by dividing by `page_size`,
    /// then clamped to `[MIN_FRAME_COUNT, MAX_FRAME_COUNT]`.
    pub cache_size: usize,
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub use_wal: bool,
    /// Directory/prefix for WAL segment files; defaults to a sibling of the database
    /// path when `None`.
    pub wal_prefix: Option<PathBuf>,
    pub log_level: LogLevel,
    pub log_target: LogTarget,
    pub max_log_size: u64,
    pub max_log_files: u32,
    pub env: Arc<dyn Env>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_PAGE_SIZE as usize * 256,
            create_if_missing: true,
            error_if_exists: false,
            use_wal: true,
            wal_prefix: None,
            log_level: LogLevel::Info,
            log_target: LogTarget::Stderr,
            max_log_size: 16 * 1024 * 1024,
            max_log_files: 4,
            env: Arc::new(OsEnv::default()),
        }
    }
}

impl Options {
    /// Validate and clamp option fields, as the teacher's `command.rs` validates CLI
    /// arguments before constructing a `Statement`. Called once by `Engine::open`.
    pub fn validate(&mut self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        self.page_size = self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);

        if self.cache_size == 0 {
            return Err(Error::invalid_argument("cache_size must be non-zero"));
        }
        Ok(())
    }

    /// Frame count derived from `cache_size`/`page_size`, clamped to the allowed
    /// range (§6).
    pub fn frame_count(&self) -> usize {
        let frames = self.cache_size / self.page_size as usize;
        frames.clamp(MIN_FRAME_COUNT, MAX_FRAME_COUNT)
    }
}
