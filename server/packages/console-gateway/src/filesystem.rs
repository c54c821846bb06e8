use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use mime_guess::MimeGuess;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use utoipa::ToSchema;

use console_gateway_error::GatewayError;

use crate::config::ConfigError;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Root-relative path with `/` separators.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileContent {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// A target inside the root: the lexical root-relative path and the
/// resolved on-disk location.
#[derive(Debug, Clone)]
struct Resolved {
    relative: PathBuf,
    absolute: PathBuf,
}

impl Resolved {
    fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    fn display(&self) -> String {
        relative_display(&self.relative)
    }
}

/// File operations confined to one per-deployment root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates the root if needed and pins its canonical location.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        let fail = |err: io::Error| ConfigError::FileRoot {
            path: root.clone(),
            message: err.to_string(),
        };
        std::fs::create_dir_all(&root).map_err(fail)?;
        let canonical = std::fs::canonicalize(&root).map_err(fail)?;
        if !canonical.is_dir() {
            return Err(ConfigError::FileRoot {
                path: root,
                message: "not a directory".to_string(),
            });
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>, GatewayError> {
        let target = self.resolve(path).await?;
        let metadata = existing_metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(GatewayError::InvalidRequest {
                message: format!("{} is not a directory", target.display()),
            });
        }

        let mut read_dir = tokio::fs::read_dir(&target.absolute)
            .await
            .map_err(|err| io_error(&target, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|err| io_error(&target, err))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata,
                // Dangling symlinks still show up, described by the link itself.
                Err(_) => match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        tracing::debug!(name = %name, error = %err, "skipping unreadable entry");
                        continue;
                    }
                },
            };
            entries.push(entry_for(&target.relative.join(&name), name, &metadata));
        }

        entries.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    pub async fn read(&self, path: &str) -> Result<FileContent, GatewayError> {
        let target = self.resolve(path).await?;
        let metadata = existing_metadata(&target).await?;
        if metadata.is_dir() {
            return Err(GatewayError::InvalidRequest {
                message: format!("{} is a directory", target.display()),
            });
        }
        let bytes = tokio::fs::read(&target.absolute)
            .await
            .map_err(|err| io_error(&target, err))?;
        let mime = MimeGuess::from_path(&target.absolute)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(FileContent { bytes, mime })
    }

    /// Writes the whole file, creating missing parent directories.
    pub async fn write(&self, path: &str, bytes: &[u8]) -> Result<FileEntry, GatewayError> {
        let target = self.resolve(path).await?;
        if target.is_root() {
            return Err(GatewayError::InvalidPath {
                path: path.to_string(),
            });
        }
        if let Ok(metadata) = tokio::fs::metadata(&target.absolute).await {
            if metadata.is_dir() {
                return Err(GatewayError::InvalidRequest {
                    message: format!("{} is a directory", target.display()),
                });
            }
        }
        if let Some(parent) = target.absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(&target, err))?;
        }
        tokio::fs::write(&target.absolute, bytes)
            .await
            .map_err(|err| io_error(&target, err))?;
        tracing::info!(path = %target.display(), bytes = bytes.len(), "file written");
        self.describe(&target).await
    }

    /// Removes a file, or a directory with everything below it.
    pub async fn delete(&self, path: &str) -> Result<(), GatewayError> {
        let target = self.resolve(path).await?;
        if target.is_root() {
            return Err(GatewayError::InvalidPath {
                path: path.to_string(),
            });
        }
        let metadata = existing_metadata(&target).await?;
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target.absolute).await
        } else {
            tokio::fs::remove_file(&target.absolute).await
        };
        result.map_err(|err| io_error(&target, err))?;
        tracing::info!(path = %target.display(), dir = metadata.is_dir(), "path deleted");
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> Result<FileEntry, GatewayError> {
        let target = self.resolve(path).await?;
        if let Ok(metadata) = tokio::fs::metadata(&target.absolute).await {
            if !metadata.is_dir() {
                return Err(GatewayError::InvalidRequest {
                    message: format!("{} exists and is not a directory", target.display()),
                });
            }
        }
        tokio::fs::create_dir_all(&target.absolute)
            .await
            .map_err(|err| io_error(&target, err))?;
        self.describe(&target).await
    }

    /// Resolves an existing directory, used as a command working directory.
    pub async fn resolve_directory(&self, path: &str) -> Result<PathBuf, GatewayError> {
        let target = self.resolve(path).await?;
        let metadata = existing_metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(GatewayError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(target.absolute)
    }

    async fn describe(&self, target: &Resolved) -> Result<FileEntry, GatewayError> {
        let metadata = existing_metadata(target).await?;
        let name = target
            .relative
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(entry_for(&target.relative, name, &metadata))
    }

    /// Maps client input onto a location under the root.
    ///
    /// Empty, `.` and `/` name the root. Parent components and any other
    /// absolute form are refused outright; the deepest existing ancestor is
    /// then canonicalized so symlinks cannot lead outside the root.
    async fn resolve(&self, input: &str) -> Result<Resolved, GatewayError> {
        let invalid = || GatewayError::InvalidPath {
            path: input.to_string(),
        };
        let trimmed = input.trim();
        let mut relative = PathBuf::new();
        if !matches!(trimmed, "" | "." | "/") {
            if trimmed.contains('\0') {
                return Err(invalid());
            }
            for component in Path::new(trimmed).components() {
                match component {
                    Component::Normal(part) => relative.push(part),
                    Component::CurDir => {}
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return Err(invalid());
                    }
                }
            }
        }

        let lexical = self.root.join(&relative);
        let mut existing = lexical.as_path();
        let mut remainder = Vec::new();
        let canonical = loop {
            match tokio::fs::canonicalize(existing).await {
                Ok(canonical) => break canonical,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // A dangling symlink canonicalizes as missing but would be
                    // followed by a later write.
                    if tokio::fs::symlink_metadata(existing).await.is_ok() {
                        tracing::warn!(path = %input, "path crosses a dangling symlink");
                        return Err(invalid());
                    }
                    let Some(name) = existing.file_name() else {
                        return Err(invalid());
                    };
                    remainder.push(name.to_os_string());
                    existing = existing.parent().ok_or_else(invalid)?;
                }
                Err(err) => {
                    return Err(GatewayError::Internal {
                        message: format!("failed to resolve {input}: {err}"),
                    })
                }
            }
        };
        if !canonical.starts_with(&self.root) {
            tracing::warn!(path = %input, "path escapes the file root");
            return Err(invalid());
        }

        let mut absolute = canonical;
        for name in remainder.into_iter().rev() {
            absolute.push(name);
        }
        Ok(Resolved { relative, absolute })
    }
}

async fn existing_metadata(target: &Resolved) -> Result<std::fs::Metadata, GatewayError> {
    tokio::fs::metadata(&target.absolute)
        .await
        .map_err(|err| io_error(target, err))
}

fn io_error(target: &Resolved, err: io::Error) -> GatewayError {
    match err.kind() {
        io::ErrorKind::NotFound => GatewayError::NotFound {
            path: target.display(),
        },
        _ => GatewayError::Internal {
            message: format!("{}: {err}", target.display()),
        },
    }
}

fn entry_for(relative: &Path, name: String, metadata: &std::fs::Metadata) -> FileEntry {
    FileEntry {
        name,
        path: relative_display(relative),
        is_dir: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: metadata.modified().ok().and_then(format_time),
    }
}

fn format_time(time: SystemTime) -> Option<String> {
    OffsetDateTime::from(time).format(&Rfc3339).ok()
}

fn relative_display(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
