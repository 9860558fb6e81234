//! Restore payloads that arrive in chunks over an external channel. Each stream
//! is exposed to the restore side as an ordinary `AsyncRead`.

use crate::error::{AppError, Result};
use crate::storage::FileStream;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Chunks buffered per stream before `push_chunk` waits for the reader.
const CHUNK_BUFFER: usize = 16;

struct UploadStream {
    tx: mpsc::Sender<Bytes>,
    /// Fails the reader. Dropping `tx` alone would look like a complete payload.
    abort: CancellationToken,
    last_activity: Instant,
    /// Senders currently waiting on a full buffer.
    sending: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct UploadStreams {
    streams: Arc<Mutex<HashMap<String, UploadStream>>>,
    idle_timeout: Duration,
}

impl UploadStreams {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        }
    }

    pub fn stream_id(user_id: &str, file_name: &str) -> String {
        format!("{user_id}-{file_name}")
    }

    /// Registers a new stream and returns its id with the reading end.
    pub async fn begin_upload_stream(
        &self,
        user_id: &str,
        file_name: &str,
    ) -> Result<(String, FileStream)> {
        let id = Self::stream_id(user_id, file_name);
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&id) {
            return Err(AppError::InvalidInput(format!(
                "Upload stream already in progress: {id}"
            )));
        }

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let abort = CancellationToken::new();
        streams.insert(
            id.clone(),
            UploadStream {
                tx,
                abort: abort.clone(),
                last_activity: Instant::now(),
                sending: Arc::new(AtomicUsize::new(0)),
            },
        );
        tracing::debug!(stream_id = %id, "Upload stream started");

        let chunks = futures::stream::unfold(Some((rx, abort)), |state| async move {
            let (mut rx, abort) = state?;
            let received = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                chunk = rx.recv() => Some(chunk),
            };
            match received {
                Some(chunk) => chunk.map(|chunk| (Ok(chunk), Some((rx, abort)))),
                None => {
                    let error = io::Error::new(io::ErrorKind::TimedOut, "Upload stream idle");
                    Some((Err(error), None))
                }
            }
        });
        let reader: FileStream = Box::new(StreamReader::new(Box::pin(chunks)));
        Ok((id, reader))
    }

    /// Waits while the reader is behind, so a slow restore throttles the sender.
    /// A sender waiting here keeps the stream alive.
    pub async fn push_chunk(&self, id: &str, chunk: Bytes) -> Result<()> {
        let (tx, sending) = {
            let mut streams = self.streams.lock().await;
            let stream = streams
                .get_mut(id)
                .ok_or_else(|| AppError::InvalidInput(format!("Unknown upload stream: {id}")))?;
            stream.last_activity = Instant::now();
            stream.sending.fetch_add(1, Ordering::SeqCst);
            (stream.tx.clone(), stream.sending.clone())
        };
        let sent = tx.send(chunk).await;
        sending.fetch_sub(1, Ordering::SeqCst);

        let mut streams = self.streams.lock().await;
        if sent.is_err() {
            streams.remove(id);
            return Err(AppError::InvalidInput(format!(
                "Upload stream closed by the reader: {id}"
            )));
        }
        if let Some(stream) = streams.get_mut(id) {
            stream.last_activity = Instant::now();
        }
        Ok(())
    }

    /// Ends the stream; the reader sees end of file after the buffered chunks.
    pub async fn end_upload_stream(&self, id: &str) -> Result<()> {
        match self.streams.lock().await.remove(id) {
            Some(_) => {
                tracing::debug!(stream_id = %id, "Upload stream ended");
                Ok(())
            }
            None => Err(AppError::InvalidInput(format!("Unknown upload stream: {id}"))),
        }
    }

    /// Destroys streams idle for longer than the timeout. Their readers fail
    /// with `TimedOut` even when chunks are still buffered.
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut streams = self.streams.lock().await;
        let idle: Vec<String> = streams
            .iter()
            .filter(|(_, s)| s.sending.load(Ordering::SeqCst) == 0)
            .filter(|(_, s)| now.duration_since(s.last_activity) > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            if let Some(stream) = streams.remove(id) {
                stream.abort.cancel();
                tracing::warn!(stream_id = %id, "Destroyed idle upload stream");
            }
        }
        idle.len()
    }

    pub async fn run_gc(self, cancel: CancellationToken) {
        let period = (self.idle_timeout / 4).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_idle().await;
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn chunks_reassemble_in_order() {
        let streams = UploadStreams::new(Duration::from_secs(60));
        let (id, mut reader) = streams.begin_upload_stream("u1", "dump.sql").await.unwrap();
        assert_eq!(id, "u1-dump.sql");

        let writer = streams.clone();
        let push_id = id.clone();
        let push = tokio::spawn(async move {
            for part in ["CREATE TABLE t();\n", "INSERT ", "INTO t DEFAULT VALUES;\n"] {
                writer.push_chunk(&push_id, Bytes::from(part)).await.unwrap();
            }
            writer.end_upload_stream(&push_id).await.unwrap();
        });

        let mut payload = String::new();
        reader.read_to_string(&mut payload).await.unwrap();
        push.await.unwrap();
        assert_eq!(payload, "CREATE TABLE t();\nINSERT INTO t DEFAULT VALUES;\n");
        assert_eq!(streams.len().await, 0);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_streams_are_rejected() {
        let streams = UploadStreams::new(Duration::from_secs(60));
        let _reader = streams.begin_upload_stream("u1", "a.dump").await.unwrap();
        assert!(streams.begin_upload_stream("u1", "a.dump").await.is_err());
        assert!(streams.push_chunk("u2-a.dump", Bytes::from("x")).await.is_err());
        assert!(streams.end_upload_stream("u2-a.dump").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_streams_fail_their_reader() {
        let streams = UploadStreams::new(Duration::from_secs(60));
        let (id, mut reader) = streams.begin_upload_stream("u1", "a.dump").await.unwrap();
        streams.push_chunk(&id, Bytes::from("partial")).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(streams.sweep_idle().await, 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(streams.sweep_idle().await, 1);

        let mut payload = Vec::new();
        let err = reader.read_to_end(&mut payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_with_full_buffer_still_fails_its_reader() {
        let streams = UploadStreams::new(Duration::from_secs(60));
        let (id, mut reader) = streams.begin_upload_stream("u1", "a.sql").await.unwrap();
        for n in 0..CHUNK_BUFFER {
            let chunk = format!("INSERT INTO t VALUES ({n});\n");
            streams.push_chunk(&id, Bytes::from(chunk)).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(streams.sweep_idle().await, 1);

        let mut payload = Vec::new();
        let err = reader.read_to_end(&mut payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_waiting_on_a_slow_reader_is_not_idle() {
        let streams = UploadStreams::new(Duration::from_secs(60));
        let (id, mut reader) = streams.begin_upload_stream("u1", "a.sql").await.unwrap();
        for _ in 0..CHUNK_BUFFER {
            streams.push_chunk(&id, Bytes::from("x")).await.unwrap();
        }

        let writer = streams.clone();
        let push_id = id.clone();
        let blocked =
            tokio::spawn(async move { writer.push_chunk(&push_id, Bytes::from("y")).await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!blocked.is_finished());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(streams.sweep_idle().await, 0);

        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await.unwrap();
        blocked.await.unwrap().unwrap();
        streams.end_upload_stream(&id).await.unwrap();

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        let payload = format!("{}{rest}", first[0] as char);
        assert_eq!(payload, format!("{}y", "x".repeat(CHUNK_BUFFER)));
    }
}
