use std::path::Path;

/// Free-space query used by the merge preflight.
pub trait DiskSpace: Send + Sync {
    /// Bytes available to this process on the filesystem holding `path`.
    fn available(&self, path: &Path) -> std::io::Result<u64>;
}

/// Queries the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2DiskSpace;

impl DiskSpace for Fs2DiskSpace {
    fn available(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Reports a fixed amount of free space.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace(pub u64);

impl DiskSpace for FixedDiskSpace {
    fn available(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs2_reports_space_for_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Fs2DiskSpace.available(dir.path()).unwrap() > 0);
    }
}
