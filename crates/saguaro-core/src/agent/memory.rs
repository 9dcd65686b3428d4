use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// Heading that opens the long-term region of the memory document.
pub const LONG_TERM_HEADING: &str = "# Long Term Memory";
/// Heading that opens the short-term region. Appends always land after it.
pub const SHORT_TERM_HEADING: &str = "# Short Term Memory";

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory I/O failed on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Flat markdown memory document with a long-term and a short-term region.
///
/// Both regions live in one file. The full text is cached in memory and every
/// mutation is written through to disk before it returns.
pub struct MemoryStore {
    path: PathBuf,
    cache: Mutex<String>,
}

impl MemoryStore {
    /// Document used when the backing file does not exist yet.
    pub fn default_document() -> String {
        format!("{LONG_TERM_HEADING}\n\n{SHORT_TERM_HEADING}\n")
    }

    /// Open the store, loading the file if present. A missing file is not an
    /// error: the store starts from [`MemoryStore::default_document`] and the
    /// file is created on the first mutation.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let path = path.into();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default_document(),
            Err(source) => return Err(MemoryError::Io { path, source }),
        };
        Ok(Self {
            path,
            cache: Mutex::new(text),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current full document.
    pub async fn read(&self) -> String {
        self.cache.lock().await.clone()
    }

    /// Replace the whole document, both regions included.
    pub async fn write(&self, content: &str) -> Result<(), MemoryError> {
        let mut cache = self.cache.lock().await;
        self.persist(content).await?;
        *cache = content.to_string();
        Ok(())
    }

    /// Append an entry to the end of the short-term region.
    pub async fn append_short_term(&self, content: &str) -> Result<(), MemoryError> {
        let mut cache = self.cache.lock().await;
        let mut doc = cache.clone();

        if short_term_offset(&doc).is_none() {
            if !doc.is_empty() && !doc.ends_with('\n') {
                doc.push('\n');
            }
            if !doc.is_empty() {
                doc.push('\n');
            }
            doc.push_str(SHORT_TERM_HEADING);
            doc.push('\n');
        } else if !doc.ends_with('\n') {
            doc.push('\n');
        }
        doc.push_str(&format!("- {content}\n"));

        self.persist(&doc).await?;
        *cache = doc;
        Ok(())
    }

    /// Text of the long-term region, without its heading.
    pub async fn long_term(&self) -> String {
        let doc = self.cache.lock().await;
        let head = match short_term_offset(&doc) {
            Some(offset) => &doc[..offset],
            None => doc.as_str(),
        };
        let head = head.trim_start();
        head.strip_prefix(LONG_TERM_HEADING)
            .unwrap_or(head)
            .trim()
            .to_string()
    }

    /// Text of the short-term region, without its heading.
    pub async fn short_term(&self) -> String {
        let doc = self.cache.lock().await;
        match short_term_offset(&doc) {
            Some(offset) => doc[offset..]
                .trim_start()
                .strip_prefix(SHORT_TERM_HEADING)
                .unwrap_or_default()
                .trim()
                .to_string(),
            None => String::new(),
        }
    }

    async fn persist(&self, content: &str) -> Result<(), MemoryError> {
        let io_err = |source| MemoryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&self.path, content).await.map_err(io_err)
    }
}

/// Byte offset of the short-term heading line, if the document has one.
fn short_term_offset(doc: &str) -> Option<usize> {
    let mut offset = 0;
    for line in doc.split_inclusive('\n') {
        if line.trim_end() == SHORT_TERM_HEADING {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}
