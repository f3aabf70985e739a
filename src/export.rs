//! Destinations for finished PNG renders.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// File name used for every export.
pub const DEFAULT_OUTPUT_NAME: &str = "nounified.png";

/// Receives a finished PNG under a deterministic name.
pub trait ExportSink {
    fn accept(&mut self, name: &str, png: &[u8]) -> Result<()>;
}

/// Writes exports to disk.
#[derive(Debug, Clone)]
pub enum FileSink {
    /// `dir/<name>`
    Dir(PathBuf),
    /// Exactly this path, ignoring the export name.
    Path(PathBuf),
}

impl FileSink {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::Dir(dir.into())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn target(&self, name: &str) -> PathBuf {
        match self {
            Self::Dir(dir) => dir.join(name),
            Self::Path(path) => path.clone(),
        }
    }
}

impl ExportSink for FileSink {
    fn accept(&mut self, name: &str, png: &[u8]) -> Result<()> {
        let path = self.target(name);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&path, png).with_context(|| format!("writing {}", path.display()))?;
        log::info!("wrote {} ({} bytes)", path.display(), png.len());
        Ok(())
    }
}

/// Collects exports in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub files: Vec<(String, Vec<u8>)>,
}

impl ExportSink for MemorySink {
    fn accept(&mut self, name: &str, png: &[u8]) -> Result<()> {
        self.files.push((name.to_string(), png.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nounify-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn dir_sink_uses_export_name() {
        let dir = scratch_dir("dir-sink");
        let mut sink = FileSink::in_dir(&dir);
        sink.accept(DEFAULT_OUTPUT_NAME, b"png").unwrap();
        assert_eq!(std::fs::read(dir.join("nounified.png")).unwrap(), b"png");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn path_sink_ignores_name() {
        let dir = scratch_dir("path-sink");
        let target = dir.join("nested").join("out.png");
        FileSink::at(&target).accept(DEFAULT_OUTPUT_NAME, b"data").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn memory_sink_collects() {
        let mut sink = MemorySink::default();
        sink.accept("a.png", &[1, 2]).unwrap();
        assert_eq!(sink.files, vec![("a.png".to_string(), vec![1, 2])]);
    }
}
