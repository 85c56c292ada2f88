use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use crate::error::Error;

const BUF_SIZE: usize = 64 * 1024;

// The service compares hashes as uppercase hex throughout.
pub fn sha1_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(data))
}

/// Streams a reader to its end, returning the uppercase SHA-1 and the
/// number of bytes read.
pub async fn sha1_of_reader<R>(reader: &mut R) -> Result<(String, u64), Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((hex::encode_upper(hasher.finalize()), total))
}

/// Uppercase SHA-1 of a file on disk, plus its size.
pub async fn sha1_of_file(path: &Path) -> Result<(String, u64), Error> {
    let mut file = File::open(path).await?;
    sha1_of_reader(&mut file).await
}

/// Uppercase SHA-1 of an inclusive byte range of a file.
pub async fn sha1_of_file_range(path: &Path, start: u64, end: u64) -> Result<String, Error> {
    if end < start {
        return Err(Error::Custom(format!("invalid byte range {start}-{end}")));
    }
    let mut file = File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let len = end - start + 1;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(BUF_SIZE as u64) as usize;
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            return Err(Error::Custom("file shorter than requested range".into()));
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode_upper(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::{sha1_hex_upper, sha1_of_file, sha1_of_file_range};

    #[test]
    fn test_sha1_hex_upper() {
        assert_eq!(
            sha1_hex_upper(b""),
            "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709"
        );
        assert_eq!(
            sha1_hex_upper(b"hello world"),
            "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED"
        );
    }

    #[tokio::test]
    async fn test_sha1_of_file_and_range() {
        let dir = std::env::temp_dir().join("pan115-hash-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let (sha, size) = sha1_of_file(&path).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(sha, "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED");

        // Inclusive range over "hello".
        let range_sha = sha1_of_file_range(&path, 0, 4).await.unwrap();
        assert_eq!(range_sha, sha1_hex_upper(b"hello"));

        // A range past the end is an error.
        assert!(sha1_of_file_range(&path, 6, 100).await.is_err());

        std::fs::remove_file(&path).ok();
    }
}
