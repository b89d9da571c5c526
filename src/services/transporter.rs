//! Transfer path for objects too large to stream in a single write.
//!
//! Both transporters stage the payload in a scratch file first, so a failed
//! destination write can be repeated without touching the source twice
//! within one attempt.

use crate::{
    errors::{MigrateError, MigrateResult},
    models::object::ObjectStat,
    stores::{ByteStream, ObjectStore},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default multipart part size: 64 MiB.
pub const DEFAULT_PART_SIZE: usize = 64 * 1024 * 1024;

#[async_trait]
pub trait LargeObjectTransporter: Send + Sync {
    /// Copy `source_key` to `dest_key`. Any error leaves the identifier
    /// pending-retry.
    async fn transfer(
        &self,
        source: &dyn ObjectStore,
        source_key: &str,
        destination: &dyn ObjectStore,
        dest_key: &str,
        stat: &ObjectStat,
    ) -> MigrateResult<()>;

    fn name(&self) -> &'static str;
}

/// A staged payload, removed when the transfer finishes either way.
pub struct ScratchFile {
    path: PathBuf,
    removed: bool,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!("removed scratch file {}", self.path.display()),
            Err(err) => warn!("could not remove scratch file {}: {}", self.path.display(), err),
        }
        self.removed = true;
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Download `key` from `source` into a fresh file under `scratch_dir`.
pub async fn download_to_scratch(
    scratch_dir: &Path,
    source: &dyn ObjectStore,
    key: &str,
) -> MigrateResult<ScratchFile> {
    fs::create_dir_all(scratch_dir)
        .await
        .map_err(|err| MigrateError::state(scratch_dir, err))?;

    let (_, mut body) = source
        .get(key)
        .await
        .map_err(|err| MigrateError::copy_failed(key, err))?
        .ok_or_else(|| MigrateError::copy_failed(key, "source object disappeared"))?;

    let scratch = ScratchFile {
        path: scratch_dir.join(format!("scratch-{}", Uuid::new_v4())),
        removed: false,
    };
    let mut file = File::create(scratch.path())
        .await
        .map_err(|err| MigrateError::copy_failed(key, err))?;

    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| MigrateError::copy_failed(key, err))?;
        file.write_all(&chunk)
            .await
            .map_err(|err| MigrateError::copy_failed(key, err))?;
        written += chunk.len() as u64;
    }
    file.sync_all()
        .await
        .map_err(|err| MigrateError::copy_failed(key, err))?;

    debug!("staged {} bytes of {} at {}", written, key, scratch.path().display());
    Ok(scratch)
}

/// Uploads the staged file through the destination's multipart write.
pub struct MultipartTransporter {
    scratch_dir: PathBuf,
    part_size: usize,
}

impl MultipartTransporter {
    pub fn new(scratch_dir: impl Into<PathBuf>, part_size: usize) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            part_size: part_size.max(1),
        }
    }
}

/// Read up to `part_size` bytes, short only at end of file.
async fn read_part(file: &mut File, part_size: usize) -> std::io::Result<Option<Bytes>> {
    let mut buf = vec![0u8; part_size];
    let mut filled = 0;
    while filled < part_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(Bytes::from(buf)))
}

fn part_stream(file: File, part_size: usize) -> ByteStream {
    Box::pin(stream::try_unfold(file, move |mut file| async move {
        let part = read_part(&mut file, part_size).await?;
        Ok::<_, std::io::Error>(part.map(|part| (part, file)))
    }))
}

#[async_trait]
impl LargeObjectTransporter for MultipartTransporter {
    async fn transfer(
        &self,
        source: &dyn ObjectStore,
        source_key: &str,
        destination: &dyn ObjectStore,
        dest_key: &str,
        stat: &ObjectStat,
    ) -> MigrateResult<()> {
        let scratch = download_to_scratch(&self.scratch_dir, source, source_key).await?;

        let upload = async {
            let file = File::open(scratch.path())
                .await
                .map_err(|err| MigrateError::copy_failed(dest_key, err))?;
            destination
                .put_multipart(dest_key, &stat.metadata, part_stream(file, self.part_size))
                .await
                .map_err(|err| MigrateError::copy_failed(dest_key, err))
        };
        let result = upload.await;
        scratch.remove().await;

        let written = result?;
        info!(
            "multipart copy of {} complete ({} bytes, tag {})",
            dest_key, written.size, written.etag
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "multipart"
    }
}

/// Hands the staged file to an external copy tool.
///
/// `{src}` in the arguments is replaced with the scratch path and `{key}` with
/// the destination key. Success is confirmed with a head on the destination.
pub struct CommandTransporter {
    scratch_dir: PathBuf,
    program: String,
    args: Vec<String>,
}

impl CommandTransporter {
    pub fn new(
        scratch_dir: impl Into<PathBuf>,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            program: program.into(),
            args,
        }
    }

    /// Build from a whitespace-separated command line.
    pub fn from_command_line(
        scratch_dir: impl Into<PathBuf>,
        command: &str,
    ) -> MigrateResult<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| MigrateError::Config("copy command is empty".into()))?;
        Ok(Self::new(scratch_dir, program, words.collect()))
    }

    fn render_args(&self, src: &Path, key: &str) -> Vec<String> {
        let src = src.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{src}", &src).replace("{key}", key))
            .collect()
    }
}

#[async_trait]
impl LargeObjectTransporter for CommandTransporter {
    async fn transfer(
        &self,
        source: &dyn ObjectStore,
        source_key: &str,
        destination: &dyn ObjectStore,
        dest_key: &str,
        _stat: &ObjectStat,
    ) -> MigrateResult<()> {
        let scratch = download_to_scratch(&self.scratch_dir, source, source_key).await?;
        let args = self.render_args(scratch.path(), dest_key);
        debug!("running {} {:?}", self.program, args);

        let status = Command::new(&self.program).args(&args).status().await;
        scratch.remove().await;

        let status = status.map_err(|err| MigrateError::copy_failed(dest_key, err))?;
        if !status.success() {
            return Err(MigrateError::copy_failed(
                dest_key,
                format!("{} exited with {}", self.program, status),
            ));
        }

        match destination.head(dest_key).await {
            Ok(Some(_)) => {
                info!("{} copied {}", self.program, dest_key);
                Ok(())
            }
            Ok(None) => Err(MigrateError::copy_failed(
                dest_key,
                "copy command succeeded but the object is absent",
            )),
            Err(err) => Err(MigrateError::copy_failed(dest_key, err)),
        }
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_arguments_are_rendered() {
        let transporter =
            CommandTransporter::from_command_line("/scratch", "mc cp {src} dest/blobs/{key}")
                .unwrap();
        assert_eq!(transporter.program, "mc");
        assert_eq!(
            transporter.render_args(Path::new("/scratch/scratch-1"), "ab/cd/ef/abcdef"),
            vec!["cp", "/scratch/scratch-1", "dest/blobs/ab/cd/ef/abcdef"]
        );
    }

    #[test]
    fn empty_command_is_a_config_error() {
        assert!(matches!(
            CommandTransporter::from_command_line("/scratch", "  "),
            Err(MigrateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn parts_split_on_part_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"abcdefg").unwrap();
        let file = File::open(&path).await.unwrap();
        let parts: Vec<Bytes> = part_stream(file, 3)
            .map(|p| p.unwrap())
            .collect()
            .await;
        assert_eq!(parts, vec![Bytes::from("abc"), Bytes::from("def"), Bytes::from("g")]);
    }
}
