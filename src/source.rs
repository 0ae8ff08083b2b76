// src/source.rs

use crate::models::{ChunkDescriptor, FileFingerprint};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

/// Where chunk payloads come from. Parallel workers call `read_chunk`
/// concurrently, so implementations must not share a seek position.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn mime_type(&self) -> &str;

    fn fingerprint(&self) -> FileFingerprint {
        FileFingerprint::new(self.name(), self.size())
    }

    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> std::io::Result<Bytes>;
}

/// A local file. Each read opens its own handle so concurrent chunk
/// reads never fight over a cursor.
pub struct FsSource {
    path: PathBuf,
    name: String,
    size: u64,
    mime_type: String,
}

impl FsSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = mime_for_name(&name).to_string();
        Ok(Self {
            path,
            name,
            size: metadata.len(),
            mime_type,
        })
    }

    /// Streaming SHA-256 of the whole file, as a collision-resistant
    /// alternative to the `(name, size)` fingerprint.
    pub async fn content_fingerprint(&self) -> std::io::Result<String> {
        let file = File::open(&self.path).await?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 1024 * 64];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[async_trait]
impl ChunkSource for FsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> std::io::Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        let mut buf = vec![0u8; chunk.length as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// MIME type from the filename extension; `application/octet-stream`
/// when unknown.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default().to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}
