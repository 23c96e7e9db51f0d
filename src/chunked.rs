//! Chunked transfer over a client scope.
//!
//! Uploads slice a byte stream into effective-size chunks and send one request per chunk,
//! strictly in order. Downloads do the reverse with ranged requests. The chunk size is read
//! from the options source once per call.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::MigrxResult;
use crate::client::HttpClient;
use crate::error::Error;
use crate::request::TransportRequest;
use crate::response::ResponseEnvelope;
use crate::util::{cancellable, http_status_error};

/// One slice of the source stream.
#[derive(Clone, Debug)]
pub struct Chunk {
    index: usize,
    offset: u64,
    data: Bytes,
}

impl Chunk {
    /// 0-based sequence number.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of the first byte within the source.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cheap to clone into a request body.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Byte range of one download chunk, `[offset, offset + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

impl ChunkRange {
    /// Splits `[0, total_len)` into consecutive ranges of at most `chunk_size` bytes.
    pub fn split(total_len: u64, chunk_size: u64) -> impl Iterator<Item = ChunkRange> {
        let chunk_size = chunk_size.max(1);
        let count = total_len.div_ceil(chunk_size);
        (0..count).map(move |index| {
            let offset = index * chunk_size;
            ChunkRange {
                index: index as usize,
                offset,
                len: chunk_size.min(total_len - offset),
            }
        })
    }

    /// Inclusive HTTP `Range` value, e.g. `bytes=0-1023`.
    pub fn range_header_value(&self) -> String {
        let last = self.offset + self.len.saturating_sub(1);
        format!("bytes={}-{}", self.offset, last)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub chunks: usize,
    pub bytes_written: u64,
}

#[derive(Clone, Debug)]
pub struct ChunkedStreamProcessor {
    client: HttpClient,
}

impl ChunkedStreamProcessor {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    /// Reads `reader` to the end in effective-size chunks, builds one request per chunk with
    /// `request_factory` and sends them sequentially through the client's pipeline.
    ///
    /// Returns one envelope per chunk, in chunk order. An empty stream sends nothing. The first
    /// failing chunk aborts the call with [`Error::ChunkSendFailed`]; chunks already sent are
    /// not rolled back. Cancellation surfaces as [`Error::Cancelled`].
    pub async fn process<T, R, F>(
        &self,
        reader: &mut R,
        mut request_factory: F,
        cancellation: &CancellationToken,
    ) -> MigrxResult<Vec<ResponseEnvelope<T>>>
    where
        T: DeserializeOwned + Send,
        R: AsyncRead + Unpin + Send + ?Sized,
        F: FnMut(&Chunk) -> MigrxResult<TransportRequest> + Send,
    {
        let snapshot = self.client.options_snapshot();
        let chunk_size = snapshot.effective_chunk_size_bytes();
        let span = info_span!(
            "migrx.chunked",
            client = %self.client.client_name(),
            direction = "upload",
            chunk_size_kb = snapshot.effective_chunk_size_kb()
        );

        async move {
            let mut envelopes = Vec::new();
            let mut offset = 0_u64;

            loop {
                let index = envelopes.len();
                let data = read_chunk(reader, chunk_size, index, cancellation).await?;
                if data.is_empty() {
                    break;
                }
                if cancellation.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let chunk = Chunk {
                    index,
                    offset,
                    data: Bytes::from(data),
                };
                let request = request_factory(&chunk)?;
                let method = request.method().clone();
                let uri = request.redacted_uri();

                let envelope = match self.client.send_typed::<T>(request, cancellation).await {
                    Ok(envelope) if envelope.is_success() => envelope,
                    Ok(envelope) => {
                        let response = envelope.response();
                        return Err(chunk_failed(
                            &chunk,
                            http_status_error(
                                response.status(),
                                &method,
                                &uri,
                                response.headers(),
                                response.body(),
                            ),
                        ));
                    }
                    Err(error) if error.is_cancelled() => return Err(error),
                    Err(error) => return Err(chunk_failed(&chunk, error)),
                };

                self.client.metrics().record_chunk_sent(chunk.len());
                debug!(
                    chunk_index = chunk.index(),
                    chunk_bytes = chunk.len(),
                    offset = chunk.offset(),
                    "chunk sent"
                );
                offset += chunk.len() as u64;
                envelopes.push(envelope);
            }

            debug!(chunks = envelopes.len(), total_bytes = offset, "chunked upload complete");
            Ok(envelopes)
        }
        .instrument(span)
        .await
    }

    /// Fetches `[0, total_len)` in effective-size ranges and writes the bodies to `writer` in
    /// order. Each body must match its range length exactly.
    pub async fn download<W, F>(
        &self,
        total_len: u64,
        mut range_factory: F,
        writer: &mut W,
        cancellation: &CancellationToken,
    ) -> MigrxResult<DownloadSummary>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
        F: FnMut(&ChunkRange) -> MigrxResult<TransportRequest> + Send,
    {
        let snapshot = self.client.options_snapshot();
        let chunk_size = snapshot.effective_chunk_size_bytes() as u64;
        let span = info_span!(
            "migrx.chunked",
            client = %self.client.client_name(),
            direction = "download",
            chunk_size_kb = snapshot.effective_chunk_size_kb(),
            total_len
        );

        async move {
            let mut summary = DownloadSummary::default();

            for range in ChunkRange::split(total_len, chunk_size) {
                if cancellation.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let request = range_factory(&range)?;
                let method = request.method().clone();
                let uri = request.redacted_uri();

                let response = match self.client.send(request, cancellation).await {
                    Ok(response) if response.is_success() => response,
                    Ok(response) => {
                        return Err(range_failed(
                            &range,
                            http_status_error(
                                response.status(),
                                &method,
                                &uri,
                                response.headers(),
                                response.body(),
                            ),
                        ));
                    }
                    Err(error) if error.is_cancelled() => return Err(error),
                    Err(error) => return Err(range_failed(&range, error)),
                };

                let actual = response.body().len() as u64;
                if actual != range.len {
                    warn!(
                        chunk_index = range.index,
                        expected = range.len,
                        actual,
                        "download chunk length mismatch"
                    );
                    return Err(Error::ChunkLengthMismatch {
                        chunk_index: range.index,
                        expected: range.len,
                        actual,
                    });
                }

                cancellable(cancellation, writer.write_all(response.body()))
                    .await?
                    .map_err(|source| Error::SinkWrite {
                        chunk_index: range.index,
                        source,
                    })?;
                self.client.metrics().record_chunk_received(response.body().len());
                debug!(chunk_index = range.index, offset = range.offset, "chunk received");
                summary.chunks += 1;
                summary.bytes_written += actual;
            }

            cancellable(cancellation, writer.flush())
                .await?
                .map_err(|source| Error::SinkWrite {
                    chunk_index: summary.chunks,
                    source,
                })?;
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

/// Fills up to `chunk_size` bytes, looping over short reads. An empty result means end of stream.
async fn read_chunk<R>(
    reader: &mut R,
    chunk_size: usize,
    chunk_index: usize,
    cancellation: &CancellationToken,
) -> MigrxResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut data = Vec::with_capacity(chunk_size);
    let mut limited = (&mut *reader).take(chunk_size as u64);
    cancellable(cancellation, limited.read_to_end(&mut data))
        .await?
        .map_err(|source| Error::SourceRead {
            chunk_index,
            source,
        })?;
    Ok(data)
}

fn chunk_failed(chunk: &Chunk, source: Error) -> Error {
    warn!(
        chunk_index = chunk.index(),
        bytes_sent = chunk.offset(),
        error = %source,
        "chunk send failed"
    );
    Error::ChunkSendFailed {
        chunk_index: chunk.index(),
        bytes_sent: chunk.offset(),
        source: Box::new(source),
    }
}

fn range_failed(range: &ChunkRange, source: Error) -> Error {
    warn!(
        chunk_index = range.index,
        bytes_received = range.offset,
        error = %source,
        "download chunk failed"
    );
    Error::ChunkSendFailed {
        chunk_index: range.index,
        bytes_sent: range.offset,
        source: Box::new(source),
    }
}
