//! Streams job artifacts from the server to local files.
//!
//! Each reference is downloaded independently: a failure is recorded in the
//! [`FetchReport`] and the remaining references are still fetched. Files
//! are created with `create_new`, so an existing file is never overwritten;
//! colliding names get a `_1`, `_2`, ... suffix before the extension.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{ComfyError, Result};
use crate::types::OutputRef;

/// Give up on finding a free name after this many suffixes.
const MAX_NAME_SUFFIX: u32 = 10_000;

/// An open artifact download.
pub struct ArtifactBody {
    /// Size announced by the server, if any.
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for ArtifactBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Where artifacts are read from and, optionally, deleted.
///
/// Implemented by [`crate::ComfyClient`] over `/view` and the configured
/// delete endpoint.
pub trait ArtifactSource: Send + Sync {
    fn open(&self, output: &OutputRef) -> impl Future<Output = Result<ArtifactBody>> + Send;

    fn delete(&self, output: &OutputRef) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub reference: OutputRef,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct FetchFailure {
    pub reference: OutputRef,
    pub error: ComfyError,
}

/// Outcome of fetching a set of references.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub saved: Vec<SavedArtifact>,
    pub failures: Vec<FetchFailure>,
}

impl FetchReport {
    /// Whether every reference was saved.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.saved.iter().map(|s| s.path.as_path()).collect()
    }
}

/// Downloads artifacts from an [`ArtifactSource`].
#[derive(Debug)]
pub struct ArtifactFetcher<'a, S> {
    source: &'a S,
    delete_after: bool,
}

impl<'a, S: ArtifactSource> ArtifactFetcher<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            delete_after: false,
        }
    }

    /// Ask the source to delete each artifact once its download is verified.
    pub fn delete_after(mut self, enabled: bool) -> Self {
        self.delete_after = enabled;
        self
    }

    /// Download `outputs` into `dest`, creating the directory if needed.
    ///
    /// Only a failure to create `dest` fails the whole call; per-reference
    /// failures land in [`FetchReport::failures`].
    pub async fn fetch(&self, outputs: &[OutputRef], dest: &Path) -> Result<FetchReport> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| ComfyError::io(format!("Failed to create {}", dest.display()), e))?;

        let mut report = FetchReport::default();
        for output in outputs {
            match self.fetch_one(output, dest).await {
                Ok(saved) => {
                    tracing::info!(
                        filename = %output.filename,
                        path = %saved.path.display(),
                        bytes = saved.bytes,
                        "Saved artifact",
                    );
                    if self.delete_after {
                        if let Err(e) = self.source.delete(output).await {
                            tracing::warn!(
                                filename = %output.filename,
                                error = %e,
                                "Could not delete artifact from server",
                            );
                        }
                    }
                    report.saved.push(saved);
                }
                Err(error) => {
                    tracing::warn!(filename = %output.filename, error = %error, "Download failed");
                    report.failures.push(FetchFailure {
                        reference: output.clone(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    async fn fetch_one(&self, output: &OutputRef, dest: &Path) -> Result<SavedArtifact> {
        let name = local_name(&output.filename)?;
        let body = self.source.open(output).await?;
        let (path, file) = create_unique(dest, name).await?;

        let (received, streamed) = write_body(file, body.stream).await;
        let outcome = match (streamed, body.content_length) {
            (Ok(()), Some(expected)) if expected != received => Err(ComfyError::DownloadIncomplete {
                filename: output.filename.clone(),
                expected,
                received,
            }),
            (Ok(()), _) => Ok(()),
            (Err(e), Some(expected)) => {
                tracing::debug!(filename = %output.filename, error = %e, "Stream broke mid-download");
                Err(ComfyError::DownloadIncomplete {
                    filename: output.filename.clone(),
                    expected,
                    received,
                })
            }
            (Err(e), None) => Err(e),
        };

        if let Err(e) = outcome {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %rm, "Could not remove partial file");
            }
            return Err(e);
        }

        Ok(SavedArtifact {
            reference: output.clone(),
            path,
            bytes: received,
        })
    }
}

/// The final path component of a server-supplied filename.
fn local_name(filename: &str) -> Result<&str> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(ComfyError::InvalidResponse(format!(
            "server returned an unusable filename '{}'",
            filename
        )));
    }
    Ok(name)
}

fn numbered(name: &str, n: u32) -> String {
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, n, ext),
        None => format!("{}_{}", stem, n),
    }
}

async fn create_unique(dest: &Path, name: &str) -> Result<(PathBuf, File)> {
    for n in 0..=MAX_NAME_SUFFIX {
        let candidate = if n == 0 {
            name.to_string()
        } else {
            numbered(name, n)
        };
        let path = dest.join(candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(ComfyError::io(format!("Failed to create {}", path.display()), e))
            }
        }
    }
    Err(ComfyError::io(
        format!("No free file name for {} in {}", name, dest.display()),
        ErrorKind::AlreadyExists.into(),
    ))
}

/// Copy the stream into `file`, returning the bytes written and how the
/// copy ended.
async fn write_body(
    mut file: File,
    mut stream: BoxStream<'static, Result<Bytes>>,
) -> (u64, Result<()>) {
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return (written, Err(e)),
        };
        if let Err(e) = file.write_all(&chunk).await {
            return (written, Err(ComfyError::io("Failed to write artifact", e)));
        }
        written += chunk.len() as u64;
    }
    if let Err(e) = file.flush().await {
        return (written, Err(ComfyError::io("Failed to flush artifact", e)));
    }
    (written, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_name_strips_directories() {
        assert_eq!(local_name("fox_001.png").unwrap(), "fox_001.png");
        assert_eq!(local_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(local_name("sub\\dir\\a.png").unwrap(), "a.png");
        assert!(local_name("..").is_err());
        assert!(local_name("dir/").is_err());
    }

    #[test]
    fn numbered_names_keep_extension() {
        assert_eq!(numbered("fox_001.png", 1), "fox_001_1.png");
        assert_eq!(numbered("archive.tar.gz", 2), "archive.tar_2.gz");
        assert_eq!(numbered("README", 3), "README_3");
    }

    #[tokio::test]
    async fn create_unique_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"old").unwrap();
        std::fs::write(dir.path().join("a_1.png"), b"old").unwrap();

        let (path, _file) = create_unique(dir.path(), "a.png").await.unwrap();
        assert_eq!(path, dir.path().join("a_2.png"));
        assert_eq!(std::fs::read(dir.path().join("a.png")).unwrap(), b"old");
    }
}
