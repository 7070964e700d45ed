//! Serving attachment bytes back to clients in bounded slices.

use std::io::{self, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use uuid::Uuid;

use crate::bridge::{Attachment, BridgeError, MediaConverter};

/// Default slice length for `get-attachment-chunk`.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024;

/// Read at most `length` bytes starting at `start`. Past EOF yields nothing.
pub async fn read_range(path: &Path, start: u64, length: u64) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    if start >= size || length == 0 {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(start)).await?;
    let want = length.min(size - start);
    let mut buf = Vec::with_capacity(want as usize);
    file.take(want).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Zlib-compress a slice.
pub fn deflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Expand a leading `~` the way the message store records paths.
pub fn real_path(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Swap a host audio attachment for its converted mp3 twin, converting on
/// first use. Any other attachment, or a failed conversion, comes back
/// unchanged.
pub async fn prepare_for_transfer(
    mut attachment: Attachment,
    convert_dir: &Path,
    converter: &dyn MediaConverter,
) -> Attachment {
    if !attachment.is_core_audio() {
        return attachment;
    }

    let target = convert_dir.join(format!("{}.mp3", attachment.guid));
    if !target.exists() {
        tracing::info!(
            target: "gateway",
            name = %attachment.transfer_name,
            "converting attachment to mp3"
        );
        let source = real_path(&attachment.file_path);
        if let Err(e) = convert_into_place(converter, &source, &target).await {
            tracing::error!(
                target: "gateway",
                name = %attachment.transfer_name,
                error = %e,
                "failed to convert attachment; serving original"
            );
            return attachment;
        }
    }

    attachment.mime_type = Some("audio/mp3".to_string());
    attachment.transfer_name = mp3_name(&attachment.transfer_name);
    attachment.file_path = target;
    attachment
}

/// Convert into a private temp file, then rename over `target`, so readers
/// only ever see a finished file even when two requests convert at once.
async fn convert_into_place(
    converter: &dyn MediaConverter,
    source: &Path,
    target: &Path,
) -> Result<(), BridgeError> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Keep the extension last; the converter picks the format from it.
    let temp = target.with_file_name(format!(".{}.{}", Uuid::new_v4().simple(), file_name));
    let converted = converter.convert(source, &temp).await;
    let result = match converted {
        Ok(()) => tokio::fs::rename(&temp, target).await.map_err(BridgeError::from),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

fn mp3_name(name: &str) -> String {
    match name.strip_suffix(".caf") {
        Some(stem) => format!("{}.mp3", stem),
        None => format!("{}.mp3", name),
    }
}
