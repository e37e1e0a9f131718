//! Packet directory archiving (`<dest>.tar.gz`).

use crate::error::{BuildError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
}

impl ArchiveFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "tar.gz" => Ok(Self::TarGz),
            other => Err(BuildError::Config(format!(
                "unsupported archive format '{other}' (expected tar.gz)"
            ))),
        }
    }
}

/// Produce `<packet_dir>.tar.gz` next to the packet directory. Entries are
/// added in sorted path order so archive bytes do not depend on directory
/// iteration order.
pub fn archive_packet_dir(packet_dir: &Path, format: ArchiveFormat) -> Result<PathBuf> {
    let ArchiveFormat::TarGz = format;
    let name = packet_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BuildError::Config("packet directory has no name".to_string()))?;
    let archive_path = PathBuf::from(format!("{}.tar.gz", packet_dir.display()));
    if archive_path.exists() {
        std::fs::remove_file(&archive_path)?;
    }

    let file = std::fs::File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut files = collect_files(packet_dir, packet_dir)?;
    files.sort();
    for rel in files {
        let full = packet_dir.join(&rel);
        let mut handle = std::fs::File::open(&full)?;
        builder.append_file(Path::new(name).join(&rel), &mut handle)?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(archive_path)
}

fn collect_files(root: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(collect_files(root, &path)?);
        } else if path.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    #[test]
    fn archive_contains_nested_files_under_dir_name() {
        let dir = TempDir::new().unwrap();
        let packet = dir.path().join("demo");
        std::fs::create_dir_all(packet.join("faiss")).unwrap();
        std::fs::write(packet.join("docs.jsonl"), "{}\n").unwrap();
        std::fs::write(packet.join("faiss/index.faiss"), b"idx").unwrap();

        let archive = archive_packet_dir(&packet, ArchiveFormat::TarGz).unwrap();
        assert!(archive.ends_with("demo.tar.gz"));

        let file = std::fs::File::open(&archive).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"demo/docs.jsonl".to_string()));
        assert!(names.contains(&"demo/faiss/index.faiss".to_string()));
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(ArchiveFormat::parse("zip").is_err());
        assert!(ArchiveFormat::parse("tar.gz").is_ok());
    }
}
