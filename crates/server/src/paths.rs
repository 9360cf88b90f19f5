//! Path resolution for mdxai-service data files.
//!
//! Resolved once at startup from: `--data-dir` / `MDXAI_DATA_DIR` > `~/.mdxai`.

use std::io;
use std::path::{Path, PathBuf};

/// Resolve the data directory. `explicit` comes from config (flag or env).
pub fn resolve_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    let home = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("HOME directory not found; pass --data-dir"))?;
    Ok(home.join(".mdxai"))
}

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sessions.db")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs(data_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(log_dir(data_dir))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let dir = resolve_data_dir(Some(Path::new("/srv/mdxai"))).unwrap();
        assert_eq!(dir, PathBuf::from("/srv/mdxai"));
        assert_eq!(db_path(&dir), PathBuf::from("/srv/mdxai/sessions.db"));
    }

    #[test]
    fn ensure_dirs_creates_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("data");
        ensure_dirs(&base).unwrap();
        assert!(log_dir(&base).is_dir());
    }
}
