//! Context sources for the proactive loop.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::agent::context::ContextItem;

/// Each non-blank line of stdin as a text observation.
pub fn stdin_lines() -> impl Stream<Item = ContextItem> + Send {
    lines_from(tokio::io::stdin())
}

/// Each non-blank line of `reader` as a text observation. Ends at EOF or on
/// the first read error.
pub fn lines_from<R>(reader: R) -> impl Stream<Item = ContextItem> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream! {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        yield ContextItem::text(line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Context input read failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Polls a file that an external capture tool keeps overwriting (a
/// screenshot, an exported window title, ...).
///
/// Images become image observations, anything else is read as text.
/// Unchanged content and a missing file produce nothing.
#[derive(Debug, Clone)]
pub struct FileSnapshotSensor {
    path: PathBuf,
    interval: Duration,
}

impl FileSnapshotSensor {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file once.
    pub async fn capture(&self) -> std::io::Result<ContextItem> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(snapshot_item(&self.path, &bytes))
    }

    /// Poll forever at the configured interval.
    pub fn stream(self) -> impl Stream<Item = ContextItem> + Send {
        stream! {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_digest: Option<u64> = None;

            loop {
                ticker.tick().await;
                let bytes = match tokio::fs::read(&self.path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("Snapshot {} not present yet", self.path.display());
                        continue;
                    }
                    Err(e) => {
                        warn!("Snapshot read failed for {}: {e}", self.path.display());
                        continue;
                    }
                };

                let digest = digest(&bytes);
                if last_digest == Some(digest) {
                    continue;
                }
                last_digest = Some(digest);

                let item = snapshot_item(&self.path, &bytes);
                if item.is_empty() {
                    continue;
                }
                yield item;
            }
        }
    }
}

fn digest(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

fn snapshot_item(path: &Path, bytes: &[u8]) -> ContextItem {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::IMAGE {
        ContextItem::image(mime.essence_str(), bytes)
    } else {
        ContextItem::text(String::from_utf8_lossy(bytes).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let input: &'static [u8] = b"first\n\n   \nsecond\n";
        let texts: Vec<String> = lines_from(input)
            .map(|item| item.text.unwrap_or_default())
            .collect()
            .await;
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn capture_detects_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.png");
        std::fs::write(&path, b"\x89PNG").unwrap();

        let item = FileSnapshotSensor::new(&path, WAIT).capture().await.unwrap();
        assert!(item.text.is_none());
        assert_eq!(item.images[0].media_type, "image/png");
        assert_eq!(item.history_text(), "[image: image/png]");
    }

    #[tokio::test]
    async fn unchanged_snapshots_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.txt");
        std::fs::write(&path, "terminal").unwrap();

        let sensor = FileSnapshotSensor::new(&path, Duration::from_millis(10));
        let mut stream = Box::pin(sensor.stream());

        let first = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(first.text.as_deref(), Some("terminal"));

        // Same content for a few polls: nothing comes out.
        assert!(tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err());

        std::fs::write(&path, "browser").unwrap();
        let second = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(second.text.as_deref(), Some("browser"));
    }

    #[tokio::test]
    async fn missing_file_waits_for_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.txt");

        let sensor = FileSnapshotSensor::new(&path, Duration::from_millis(10));
        let mut stream = Box::pin(sensor.stream());

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            tokio::fs::write(writer_path, "appeared").await.unwrap();
        });

        let item = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(item.text.as_deref(), Some("appeared"));
    }
}
