use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(250);

/// How entries are laid out in the backing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreFormat {
    /// `{"key": value}`; no expiry support.
    #[default]
    Raw,
    /// `{"key": {"data": value, "expires": ms}}`.
    Expiring,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Names the store on the wire (`<prefix>:read`, ...).
    pub prefix: String,
    pub path: PathBuf,
    pub flush_debounce: Duration,
    pub format: StoreFormat,
    /// Reload when another process rewrites the file.
    pub watch_external: bool,
}

impl StoreConfig {
    pub fn new(prefix: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            path: path.into(),
            flush_debounce: DEFAULT_FLUSH_DEBOUNCE,
            format: StoreFormat::Raw,
            watch_external: true,
        }
    }

    pub fn with_flush_debounce(mut self, flush_debounce: Duration) -> Self {
        self.flush_debounce = flush_debounce;
        self
    }

    pub fn with_format(mut self, format: StoreFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_watch_external(mut self, watch_external: bool) -> Self {
        self.watch_external = watch_external;
        self
    }

    /// Long-lived user preferences.
    pub fn preferences(dir: &Path) -> Self {
        Self::new("preferences", dir.join("preferences.json"))
    }

    /// Transient cache whose entries may expire.
    pub fn cache(dir: &Path) -> Self {
        Self::new("cache", dir.join("cache.json"))
            .with_flush_debounce(Duration::from_secs(1))
            .with_format(StoreFormat::Expiring)
    }

    /// Session-scoped scratch data.
    pub fn temp(dir: &Path) -> Self {
        Self::new("temp", dir.join("temp.json"))
            .with_flush_debounce(Duration::from_millis(100))
            .with_format(StoreFormat::Expiring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_use_distinct_files_and_windows() {
        let dir = Path::new("/data");
        let presets = [
            StoreConfig::preferences(dir),
            StoreConfig::cache(dir),
            StoreConfig::temp(dir),
        ];
        let prefixes = presets.iter().map(|c| c.prefix.as_str()).collect::<Vec<_>>();
        assert_eq!(prefixes, ["preferences", "cache", "temp"]);
        assert_eq!(presets[0].format, StoreFormat::Raw);
        assert_eq!(presets[1].path, dir.join("cache.json"));
        assert!(presets[2].flush_debounce < presets[0].flush_debounce);
        assert!(presets.iter().all(|c| c.watch_external));
    }
}
