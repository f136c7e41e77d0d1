//! Upload source checksums.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const CHUNK: usize = 64 * 1024;

/// Hex SHA-256 of a file, read in chunks.
pub async fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn known_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            file_checksum(file.path()).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn large_file_spans_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = vec![7u8; CHUNK * 2 + 11];
        file.write_all(&data).unwrap();
        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(file_checksum(file.path()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn missing_file_errors() {
        assert!(file_checksum(Path::new("/nonexistent/source.bin")).await.is_err());
    }
}
