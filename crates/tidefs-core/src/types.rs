use serde::{Deserialize, Serialize};

/// Stable identifier of a file object within a mounted tidefs instance.
///
/// Assigned by the filesystem driver (the server-side object id); the crypto
/// layer uses it only for membership tracking and logging.
pub type FileId = u64;

/// File-type classification, as far as the encryption layer cares.
///
/// Regular files use the contents encryption mode; directories and symlinks
/// use the filenames mode. Everything else is never encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Device nodes, sockets and FIFOs: never encrypted
    Other,
}

impl FileKind {
    pub fn is_encryptable(self) -> bool {
        !matches!(self, FileKind::Other)
    }
}
