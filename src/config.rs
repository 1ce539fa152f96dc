use std::path::PathBuf;
use std::sync::Arc;

/// Compression level requested for chunk payloads.
///
/// The codec itself is out of scope for the store coordinator; this is only
/// the knob the coordinator threads through to whichever compressor the
/// caller wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Fast,
    High,
}

/// A handler invoked from the background writer thread whenever it catches an
/// error it can't propagate to a caller. Matches the teacher's preference for
/// swallowing background-thread errors through a caller-supplied sink rather
/// than panicking the process.
pub type BackgroundExceptionHandler = Arc<dyn Fn(&crate::StoreError) + Send + Sync>;

/// Configuration accepted by [`crate::Store::open`].
///
/// Named and defaulted after the public `open(config)` surface in §6: every
/// field here corresponds to one of the documented configuration keys.
#[derive(Clone)]
pub struct StoreConfig {
    pub(crate) file_name: Option<PathBuf>,
    pub(crate) read_only: bool,
    pub(crate) encryption_key: Option<Vec<u8>>,
    pub(crate) cache_size_mb: usize,
    pub(crate) cache_concurrency: usize,
    pub(crate) page_split_size: usize,
    pub(crate) keys_per_page: usize,
    pub(crate) compress: Compression,
    /// KiB of disk buffered before an auto-commit is triggered; internally
    /// scaled by 19 KiB of heap per KiB of disk to produce `auto_commit_memory`.
    pub(crate) auto_commit_buffer_size_kb: usize,
    pub(crate) auto_commit_delay_ms: u64,
    pub(crate) auto_compact_fill_rate: u32,
    pub(crate) background_exception_handler: Option<BackgroundExceptionHandler>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file_name: None,
            read_only: false,
            encryption_key: None,
            cache_size_mb: 16,
            cache_concurrency: 16,
            page_split_size: 16 * 1024,
            keys_per_page: 48,
            compress: Compression::None,
            auto_commit_buffer_size_kb: 1024,
            auto_commit_delay_ms: 1000,
            auto_compact_fill_rate: 40,
            background_exception_handler: None,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("file_name", &self.file_name)
            .field("read_only", &self.read_only)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("cache_size_mb", &self.cache_size_mb)
            .field("cache_concurrency", &self.cache_concurrency)
            .field("page_split_size", &self.page_split_size)
            .field("keys_per_page", &self.keys_per_page)
            .field("compress", &self.compress)
            .field("auto_commit_buffer_size_kb", &self.auto_commit_buffer_size_kb)
            .field("auto_commit_delay_ms", &self.auto_commit_delay_ms)
            .field("auto_compact_fill_rate", &self.auto_compact_fill_rate)
            .finish()
    }
}

impl StoreConfig {
    /// Open (or create) a file-backed store at the given path.
    #[must_use]
    pub fn file_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_name = Some(path.into());
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the encryption key. The key is zeroed in this builder once the
    /// store has consumed it, matching the teacher's zero-on-return contract
    /// for sensitive buffers.
    #[must_use]
    pub fn encryption_key(mut self, key: Vec<u8>) -> Self {
        self.encryption_key = Some(key);
        self
    }

    #[must_use]
    pub fn cache_size_mb(mut self, mb: usize) -> Self {
        self.cache_size_mb = mb;
        self
    }

    #[must_use]
    pub fn cache_concurrency(mut self, n: usize) -> Self {
        self.cache_concurrency = n;
        self
    }

    #[must_use]
    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = bytes;
        self
    }

    #[must_use]
    pub fn keys_per_page(mut self, n: usize) -> Self {
        self.keys_per_page = n;
        self
    }

    #[must_use]
    pub fn compress(mut self, compress: Compression) -> Self {
        self.compress = compress;
        self
    }

    #[must_use]
    pub fn auto_commit_buffer_size_kb(mut self, kb: usize) -> Self {
        self.auto_commit_buffer_size_kb = kb;
        self
    }

    #[must_use]
    pub fn auto_commit_delay_ms(mut self, ms: u64) -> Self {
        self.auto_commit_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn auto_compact_fill_rate(mut self, percent: u32) -> Self {
        self.auto_compact_fill_rate = percent;
        self
    }

    #[must_use]
    pub fn background_exception_handler(mut self, handler: BackgroundExceptionHandler) -> Self {
        self.background_exception_handler = Some(handler);
        self
    }

    /// `autoCommitMemory`: heap bytes buffered before an implicit commit is
    /// forced from `beforeWrite`. 19 KiB of heap per KiB of disk buffer,
    /// per §6.
    pub(crate) fn auto_commit_memory(&self) -> usize {
        self.auto_commit_buffer_size_kb * 19 * 1024
    }
}

impl Drop for StoreConfig {
    fn drop(&mut self) {
        if let Some(key) = self.encryption_key.as_mut() {
            key.iter_mut().for_each(|b| *b = 0);
        }
    }
}
