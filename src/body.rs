use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;

/// Chunks each tee side may buffer before the pump stops pulling from the
/// source, which bounds memory while a slow consumer catches up.
const TEE_CHANNEL_CAPACITY: usize = 8;

/// An at-most-once sequence of body chunks.
///
/// Responses carry their payload as one of these; once the chunks have
/// been pulled the stream is exhausted. [`BodyStream::tee`] is the only
/// way to obtain a second reading.
pub struct BodyStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
}

impl BodyStream {
    pub fn empty() -> Self {
        Self {
            inner: stream::empty().boxed(),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            inner: stream::once(async move { Ok(bytes) }).boxed(),
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// Concatenates every remaining chunk.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Splits this stream into two independent streams that each yield the
    /// same chunks with boundaries preserved.
    ///
    /// A pump task drives the source and keeps at most a small bounded
    /// number of chunks in flight per side, so neither consumer can force
    /// unbounded buffering. Dropping one side detaches it; the pump keeps
    /// feeding the other side until the source is exhausted.
    pub fn tee(self) -> (BodyStream, BodyStream) {
        let (tx_a, rx_a) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_CAPACITY);
        let mut source = self.inner;
        tokio::spawn(async move {
            let mut side_a = Some(tx_a);
            let mut side_b = Some(tx_b);
            while let Some(item) = source.next().await {
                let (item_a, item_b) = duplicate(item);
                if let Some(tx) = side_a.as_ref()
                    && tx.send(item_a).await.is_err()
                {
                    side_a = None;
                }
                if let Some(tx) = side_b.as_ref()
                    && tx.send(item_b).await.is_err()
                {
                    side_b = None;
                }
                if side_a.is_none() && side_b.is_none() {
                    break;
                }
            }
        });
        (Self::from_receiver(rx_a), Self::from_receiver(rx_b))
    }

    fn from_receiver(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self::from_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

fn duplicate(item: io::Result<Bytes>) -> (io::Result<Bytes>, io::Result<Bytes>) {
    match item {
        Ok(chunk) => (Ok(chunk.clone()), Ok(chunk)),
        Err(err) => {
            let kind = err.kind();
            let message = err.to_string();
            (
                Err(io::Error::new(kind, message.clone())),
                Err(io::Error::new(kind, message)),
            )
        }
    }
}

impl Default for BodyStream {
    fn default() -> Self {
        Self::empty()
    }
}

impl Stream for BodyStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BodyStream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(chunks: &[&str]) -> BodyStream {
        let items: Vec<io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        BodyStream::from_stream(stream::iter(items))
    }

    #[tokio::test]
    async fn collect_concatenates_chunks() -> io::Result<()> {
        let body = chunked(&["abc", "def", "g"]);
        assert_eq!(body.collect().await?, Bytes::from_static(b"abcdefg"));
        Ok(())
    }

    #[tokio::test]
    async fn tee_preserves_chunk_boundaries_on_both_sides() -> io::Result<()> {
        let (mut left, mut right) = chunked(&["one", "two", "three"]).tee();

        let mut left_chunks = Vec::new();
        while let Some(chunk) = left.next().await {
            left_chunks.push(chunk?);
        }
        let mut right_chunks = Vec::new();
        while let Some(chunk) = right.next().await {
            right_chunks.push(chunk?);
        }

        let expected = vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ];
        assert_eq!(left_chunks, expected);
        assert_eq!(right_chunks, expected);
        Ok(())
    }

    #[tokio::test]
    async fn tee_survives_dropped_consumer() -> io::Result<()> {
        let chunks: Vec<io::Result<Bytes>> = (0..64)
            .map(|i| Ok(Bytes::from(vec![i as u8; 128])))
            .collect();
        let (left, right) = BodyStream::from_stream(stream::iter(chunks)).tee();
        drop(left);

        let collected = right.collect().await?;
        assert_eq!(collected.len(), 64 * 128);
        Ok(())
    }

    #[tokio::test]
    async fn tee_propagates_source_errors_to_both_sides() {
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"head")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")),
        ];
        let (left, right) = BodyStream::from_stream(stream::iter(items)).tee();

        assert!(left.collect().await.is_err());
        assert!(right.collect().await.is_err());
    }

    #[tokio::test]
    async fn empty_body_yields_nothing() -> io::Result<()> {
        assert!(BodyStream::empty().collect().await?.is_empty());
        Ok(())
    }
}
