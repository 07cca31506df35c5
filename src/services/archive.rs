use std::io::{Cursor, Read};

use async_trait::async_trait;

/// One file pulled out of an archive.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Archive expansion collaborator. Only the interface is core; the
/// zip-walking below is mechanical.
#[async_trait]
pub trait ArchiveExpander: Send + Sync {
    async fn expand(&self, zip_bytes: &[u8]) -> Result<Vec<ArchiveMember>, ArchiveError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to read zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to read archive member {name}: {source}")]
    Member {
        name: String,
        source: std::io::Error,
    },
}

/// In-process zip expander.
pub struct ZipExpander;

#[async_trait]
impl ArchiveExpander for ZipExpander {
    async fn expand(&self, zip_bytes: &[u8]) -> Result<Vec<ArchiveMember>, ArchiveError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;
        let mut members = Vec::new();

        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            // macOS resource forks and similar junk entries
            if name.starts_with("__MACOSX/") || name.ends_with(".DS_Store") {
                continue;
            }

            let mut bytes = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut bytes).map_err(|source| ArchiveError::Member {
                name: name.clone(),
                source,
            })?;

            let mime_type = mime_for(&name);
            members.push(ArchiveMember {
                name,
                bytes,
                mime_type,
            });
        }

        Ok(members)
    }
}

fn mime_for(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower.ends_with(".pdf") {
        "application/pdf".to_string()
    } else if lower.ends_with(".zip") {
        "application/zip".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}
