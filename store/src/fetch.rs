//! Downloading content for the built-in URL fetch builder.
use std::path::Path;

use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};
use url::Url;

use crate::archive::unpack_archive;
use crate::Error;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Opens the contents behind `url` for reading.
    async fn get(&self, url: &Url) -> Result<Box<dyn AsyncBufRead + Send + Unpin>, Error>;
}

/// Fetches `http(s)://` URLs with [reqwest], and reads `file://` URLs from
/// the local filesystem.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn fetch_error(url: &Url, reason: impl ToString) -> Error {
    Error::Fetch {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), fields(url = %url), err)]
    async fn get(&self, url: &Url) -> Result<Box<dyn AsyncBufRead + Send + Unpin>, Error> {
        match url.scheme() {
            "http" | "https" => {
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| fetch_error(url, e))?;

                debug!(status = %response.status(), "got response");

                Ok(Box::new(StreamReader::new(Box::pin(
                    response.bytes_stream().map_err(std::io::Error::other),
                ))))
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| fetch_error(url, "not a local path"))?;
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| fetch_error(url, e))?;
                Ok(Box::new(BufReader::new(file)))
            }
            scheme => Err(fetch_error(url, format!("unsupported scheme {scheme}"))),
        }
    }
}

/// Name the fetched file is stored as when it isn't an archive.
pub(crate) fn url_basename(url: &Url) -> Option<&str> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
}

fn is_tarball(url: &Url) -> bool {
    let path = url.path();
    path.ends_with(".tar.gz") || path.ends_with(".tgz")
}

/// Downloads `url` through `fetcher` into the directory `out`.
///
/// Gzipped tarballs are unpacked into `out`, anything else is written to
/// `out/<basename>`. The download is spooled through `scratch` first.
#[instrument(skip(fetcher, scratch), fields(url = %url), err)]
pub async fn fetch_into(
    fetcher: &dyn Fetcher,
    url: &Url,
    out: &Path,
    scratch: std::fs::File,
) -> Result<(), Error> {
    let mut reader = fetcher.get(url).await?;
    let mut file = tokio::fs::File::from_std(scratch);
    tokio::io::copy_buf(&mut reader, &mut file)
        .await
        .map_err(|e| fetch_error(url, e))?;
    file.flush().await?;
    file.rewind().await?;

    if is_tarball(url) {
        let decoder = GzipDecoder::new(BufReader::new(file));
        unpack_archive(decoder, out).await
    } else {
        let name = url_basename(url).ok_or_else(|| fetch_error(url, "no file name in url"))?;
        let mut dst = tokio::fs::File::create(out.join(name)).await?;
        tokio::io::copy(&mut file, &mut dst).await?;
        Ok(())
    }
}
