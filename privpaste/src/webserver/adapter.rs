//! Translates client requests into store calls.
//!
//! Content only flows through the descriptors that the store hands
//! out; this side never opens a path in the store.

use crate::{
    error::Error,
    mime::MimeMap,
    rpc::{Created, ItemInfo, StoreClient, StoreError},
    store::{
        token::{self, ID_LENGTH, OWNER_LENGTH},
        Limits,
    },
};
use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use privpaste_log::{debug, warn};
use std::{fs::File, io, time::Duration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the chunks read from an item.
const CHUNK_SIZE: usize = 64 * 1024;

/// Longest MIME type that is passed to the store.
pub const MAX_MIME_LENGTH: usize = 255;

#[derive(Debug)]
pub struct Adapter {
    client: StoreClient,
    limits: Limits,
    mime_map: MimeMap,
}

impl Adapter {
    pub fn new(client: StoreClient, limits: Limits, mime_map: MimeMap) -> Self {
        Self {
            client,
            limits,
            mime_map,
        }
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Store the body as a new item.
    ///
    /// The item only becomes readable after the body was completely
    /// written, synced and closed; any failure on the way discards it.
    pub async fn upload<S, E>(
        &self,
        size: u64,
        mime: &str,
        lifetime: Duration,
        body: S,
    ) -> Result<Created, Error>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if size > self.limits.max_size {
            return Err(StoreError::SizeExceeded.into());
        }
        if mime.len() > MAX_MIME_LENGTH {
            return Err(Error::Config("MIME type is too long".into()));
        }

        let (created, file) = self.client.create(size, mime, lifetime).await?;

        if let Err(err) = self.write_body(file, body).await {
            debug!("upload failed"; "id" => &created.id, "error" => %err);
            if let Err(err) = self.client.abort(&created.id, &created.owner).await {
                warn!("failed to abort upload"; "id" => &created.id, "error" => %err);
            }
            return Err(err);
        }

        let size = self.client.commit(&created.id, &created.owner).await?;
        debug!("upload committed"; "id" => &created.id, "size" => size);

        Ok(created)
    }

    async fn write_body<S, E>(&self, file: File, body: S) -> Result<u64, Error>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut file = tokio::fs::File::from_std(file);
        let mut written = 0u64;

        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            written += chunk.len() as u64;
            if written > self.limits.max_size {
                return Err(StoreError::SizeExceeded.into());
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(written)
    }

    /// Look up an item and stream its content.
    ///
    /// The returned MIME type has the overrides applied.  The stream
    /// fails if the content ends before the recorded size.
    pub async fn download(
        &self,
        id: &str,
    ) -> Result<(ItemInfo, BoxStream<'static, io::Result<Bytes>>), Error> {
        if !token::is_valid(id, ID_LENGTH) {
            return Err(StoreError::NotFound.into());
        }

        let (mut info, file) = self.client.fetch(id).await?;
        info.mime = self.mime_map.apply(&info.mime);
        let content = read_content(tokio::fs::File::from_std(file), info.size);
        Ok((info, content.boxed()))
    }

    pub async fn delete(&self, id: &str, owner: &str) -> Result<(), Error> {
        // Malformed tokens never reach the store.
        if !token::is_valid(id, ID_LENGTH) || !token::is_valid(owner, OWNER_LENGTH) {
            return Err(StoreError::NotFound.into());
        }
        self.client.delete(id, owner).await
    }
}

fn read_content(file: tokio::fs::File, size: u64) -> impl Stream<Item = io::Result<Bytes>> {
    stream::unfold((file, size), |(mut file, remaining)| async move {
        if remaining == 0 {
            return None;
        }

        let length = usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));
        let mut buf = vec![0u8; length];
        match file.read(&mut buf).await {
            Ok(0) => Some((
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "item content is truncated",
                )),
                (file, 0),
            )),
            Ok(length) => {
                buf.truncate(length);
                Some((Ok(Bytes::from(buf)), (file, remaining - length as u64)))
            }
            Err(err) => Some((Err(err), (file, 0))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::read_content;
    use futures::StreamExt;
    use std::io::{self, Seek, SeekFrom, Write};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_content() {
        let mut file = tempfile::tempfile().unwrap();
        let data = vec![7u8; 100_000];
        file.write_all(&data).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let file = tokio::fs::File::from_std(file);

        let chunks = read_content(file, data.len() as u64)
            .collect::<Vec<_>>()
            .await;
        let content = chunks
            .into_iter()
            .map(Result::unwrap)
            .fold(vec![], |mut acc, chunk| {
                acc.extend_from_slice(&chunk);
                acc
            });
        assert_eq!(content, data);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_truncated_content() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"short").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let file = tokio::fs::File::from_std(file);

        let chunks = read_content(file, 10).collect::<Vec<_>>().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().as_ref(), b"short");
        assert_eq!(
            chunks[1].as_ref().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
