use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

/// Copy `src` into `dst` recursively, overwriting existing files.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {} -> {}", entry.path().display(), target.display()))?;
        }
    }
    Ok(())
}

/// Rename `file` into `dest_dir`. A name collision at the destination is
/// resolved by inserting a millisecond timestamp before the extension, so
/// the rename never overwrites and never loses data.
pub fn move_into_unique(file: &Path, dest_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir).with_context(|| format!("create {}", dest_dir.display()))?;
    let name = file
        .file_name()
        .with_context(|| format!("{} has no file name", file.display()))?;
    let mut dest = dest_dir.join(name);

    if dest.exists() {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = file
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        dest = dest_dir.join(format!("{stem}-{}{ext}", Utc::now().timestamp_millis()));
    }

    std::fs::rename(file, &dest)
        .with_context(|| format!("rename {} -> {}", file.display(), dest.display()))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_directories() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/file.txt"), "x").unwrap();
        std::fs::write(src.path().join("top.txt"), "y").unwrap();

        copy_dir_recursive(src.path(), dst.path()).unwrap();

        assert_eq!(std::fs::read_to_string(dst.path().join("a/b/file.txt")).unwrap(), "x");
        assert_eq!(std::fs::read_to_string(dst.path().join("top.txt")).unwrap(), "y");
    }

    #[test]
    fn copy_overwrites_existing_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f.txt"), "new").unwrap();
        std::fs::write(dst.path().join("f.txt"), "old").unwrap();

        copy_dir_recursive(src.path(), dst.path()).unwrap();
        assert_eq!(std::fs::read_to_string(dst.path().join("f.txt")).unwrap(), "new");
    }

    #[test]
    fn move_lands_in_destination() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("next.yml");
        std::fs::write(&from, "name: x").unwrap();
        let dest_dir = dir.path().join("running");

        let moved = move_into_unique(&from, &dest_dir).unwrap();
        assert_eq!(moved, dest_dir.join("next.yml"));
        assert!(!from.exists());
    }

    #[test]
    fn collision_gets_timestamp_suffix_before_extension() {
        let dir = tempfile::tempdir().unwrap();
        let dest_dir = dir.path().join("finished");
        std::fs::create_dir_all(&dest_dir).unwrap();
        std::fs::write(dest_dir.join("next.yml"), "already here").unwrap();

        let from = dir.path().join("next.yml");
        std::fs::write(&from, "incoming").unwrap();

        let moved = move_into_unique(&from, &dest_dir).unwrap();
        assert_ne!(moved, dest_dir.join("next.yml"));
        let name = moved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("next-"));
        assert!(name.ends_with(".yml"));
        // Nothing lost: both files exist with their own contents.
        assert_eq!(std::fs::read_to_string(dest_dir.join("next.yml")).unwrap(), "already here");
        assert_eq!(std::fs::read_to_string(&moved).unwrap(), "incoming");
    }
}
