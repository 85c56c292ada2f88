//! # Upload Sources
//!
//! The byte inputs the engine accepts, reduced to two shapes: sources
//! with a known size that can be re-read (buffer, local file, ranged
//! URL), and one-shot chunk streams. Re-readable sources can answer the
//! server's range-hash challenge; streams fall back to the sample path.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;

use futures_util::{Stream, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::StreamReader;

use crate::client::Client;
use crate::error::Error;
use crate::utils::hash;

/// A finite lazy sequence of chunks, possibly of unknown total size.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send + Sync>>;

/// A reader over a source, positioned where the engine asked.
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

pub enum UploadSource {
    /// In-memory content.
    Buffer(Vec<u8>),
    /// A local file.
    Path(PathBuf),
    /// Content proxied from an HTTP(S) URL.
    Url(String),
    /// A one-shot chunk stream; resumable and hashable only as far as
    /// discarding a prefix allows.
    Stream {
        size: Option<u64>,
        stream: Option<ByteStream>,
    },
}

impl UploadSource {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        UploadSource::Buffer(data.into())
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        UploadSource::Path(path.into())
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        UploadSource::Url(url.into())
    }

    pub fn from_stream(size: Option<u64>, stream: ByteStream) -> Self {
        UploadSource::Stream {
            size,
            stream: Some(stream),
        }
    }

    /// A file name implied by the source, when it has one.
    pub fn default_name(&self) -> Option<String> {
        match self {
            UploadSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            UploadSource::Url(url) => reqwest::Url::parse(url).ok().and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            }),
            _ => None,
        }
    }

    /// Size when knowable without consuming the source.
    pub async fn size(&self) -> Result<Option<u64>, Error> {
        match self {
            UploadSource::Buffer(data) => Ok(Some(data.len() as u64)),
            UploadSource::Path(path) => Ok(Some(tokio::fs::metadata(path).await?.len())),
            UploadSource::Stream { size, .. } => Ok(*size),
            UploadSource::Url(_) => Ok(None),
        }
    }

    /// Whether the engine can go back and re-read arbitrary ranges.
    pub fn is_rereadable(&self) -> bool {
        !matches!(self, UploadSource::Stream { .. })
    }

    /// Uppercase SHA-1 of an inclusive byte range. Only re-readable
    /// sources can answer; the range hash is what the server's upload
    /// challenge asks for.
    pub async fn range_sha1(
        &self,
        client: &Client,
        start: u64,
        end: u64,
    ) -> Result<String, Error> {
        if end < start {
            return Err(Error::Custom(format!("invalid byte range {start}-{end}")));
        }
        match self {
            UploadSource::Buffer(data) => {
                let end = end as usize;
                if end >= data.len() {
                    return Err(Error::Custom("range beyond buffer".into()));
                }
                Ok(hash::sha1_hex_upper(&data[start as usize..=end]))
            }
            UploadSource::Path(path) => hash::sha1_of_file_range(path, start, end).await,
            UploadSource::Url(url) => {
                let resp = client
                    .http()
                    .get(url)
                    .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
                    .send()
                    .await?;
                if resp.status().as_u16() != 206 {
                    return Err(Error::Custom("url source does not accept ranges".into()));
                }
                let body = resp.bytes().await?;
                if body.len() as u64 != end - start + 1 {
                    return Err(Error::Custom("short range response".into()));
                }
                Ok(hash::sha1_hex_upper(&body))
            }
            UploadSource::Stream { .. } => {
                Err(Error::Custom("stream source cannot re-read a range".into()))
            }
        }
    }

    /// Opens a reader positioned `offset` bytes in. A stream source can
    /// only do this once, discarding the prefix.
    pub async fn open_at(&mut self, client: &Client, offset: u64) -> Result<SourceReader, Error> {
        match self {
            UploadSource::Buffer(data) => {
                if offset > data.len() as u64 {
                    return Err(Error::Custom("offset beyond buffer".into()));
                }
                Ok(Box::new(std::io::Cursor::new(
                    data[offset as usize..].to_vec(),
                )))
            }
            UploadSource::Path(path) => {
                let mut file = tokio::fs::File::open(&*path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                Ok(Box::new(file))
            }
            UploadSource::Url(url) => {
                let mut req = client.http().get(&*url);
                if offset > 0 {
                    req = req.header(reqwest::header::RANGE, format!("bytes={offset}-"));
                }
                let resp = req.send().await?.error_for_status()?;
                if offset > 0 && resp.status().as_u16() != 206 {
                    return Err(Error::Custom("url source does not accept ranges".into()));
                }
                let stream = resp
                    .bytes_stream()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
                Ok(Box::new(StreamReader::new(Box::pin(stream))))
            }
            UploadSource::Stream { stream, .. } => {
                let stream = stream
                    .take()
                    .ok_or_else(|| Error::Custom("stream source already consumed".into()))?;
                let mapped = stream.map_ok(std::io::Cursor::new);
                let mut reader: SourceReader = Box::new(StreamReader::new(mapped));
                if offset > 0 {
                    let skipped =
                        tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink())
                            .await?;
                    if skipped != offset {
                        return Err(Error::Custom("stream shorter than resume offset".into()));
                    }
                }
                Ok(reader)
            }
        }
    }
}

/// Reads up to `limit` bytes from a reader, short only at end of input.
pub(crate) async fn read_up_to(reader: &mut SourceReader, limit: u64) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(limit.min(4 * 1024 * 1024) as usize);
    (&mut *reader).take(limit).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use futures_util::stream;

    use super::{read_up_to, ByteStream, UploadSource};

    fn chunked(chunks: Vec<Vec<u8>>) -> ByteStream {
        Box::pin(stream::iter(chunks.into_iter().map(Ok)))
    }

    #[test]
    fn test_default_name() {
        assert_eq!(
            UploadSource::from_path("/tmp/dir/report.pdf").default_name(),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            UploadSource::from_url("https://example.com/a/b/c.bin?x=1").default_name(),
            Some("c.bin".to_string())
        );
        assert_eq!(UploadSource::from_bytes(b"x".to_vec()).default_name(), None);
    }

    #[tokio::test]
    async fn test_buffer_range_and_offset() {
        let client = crate::client::Client::new("UID=1; CID=2; SEID=3").unwrap();
        let data: Vec<u8> = (0..=255u8).collect();
        let source = UploadSource::from_bytes(data.clone());
        let sha = source.range_sha1(&client, 10, 19).await.unwrap();
        assert_eq!(sha, crate::utils::hash::sha1_hex_upper(&data[10..=19]));
        assert!(source.range_sha1(&client, 0, 256).await.is_err());

        let mut source = UploadSource::from_bytes(data.clone());
        let mut reader = source.open_at(&client, 200).await.unwrap();
        let rest = read_up_to(&mut reader, 1000).await.unwrap();
        assert_eq!(rest, &data[200..]);
    }

    #[tokio::test]
    async fn test_stream_offset_discard() {
        let client = crate::client::Client::new("UID=1; CID=2; SEID=3").unwrap();
        let mut source = UploadSource::from_stream(
            Some(9),
            chunked(vec![b"abc".to_vec(), b"def".to_vec(), b"ghi".to_vec()]),
        );
        assert!(source.size().await.unwrap() == Some(9));
        assert!(!source.is_rereadable());
        let mut reader = source.open_at(&client, 4).await.unwrap();
        assert_eq!(read_up_to(&mut reader, 100).await.unwrap(), b"efghi");
        // A stream only opens once.
        assert!(source.open_at(&client, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_read_up_to_chunking() {
        let client = crate::client::Client::new("UID=1; CID=2; SEID=3").unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let mut source = UploadSource::from_bytes(data.clone());
        let mut reader = source.open_at(&client, 0).await.unwrap();
        assert_eq!(read_up_to(&mut reader, 40).await.unwrap(), &data[..40]);
        assert_eq!(read_up_to(&mut reader, 40).await.unwrap(), &data[40..80]);
        assert_eq!(read_up_to(&mut reader, 40).await.unwrap(), &data[80..]);
        assert!(read_up_to(&mut reader, 40).await.unwrap().is_empty());
    }
}
