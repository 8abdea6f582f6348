use crate::error::{PrintError, PrintOutcome, TransportError, WriteOutcome};
use crate::protocol::*;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Longest wait before a segment; larger delays are clamped so the deadline
/// stays representable.
const MAX_SEGMENT_WAIT: Duration = Duration::from_secs(86400 * 365 * 30);

/// Writable characteristic of a connected printer.
/// Implement this for your BLE or mock transport.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Write one buffer. Completes once the transport has accepted it.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Endpoint + ?Sized> Endpoint for Arc<T> {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data).await
    }
}

/// Issues single writes against an optional endpoint.
pub struct CharacteristicWriter;

impl CharacteristicWriter {
    /// Write `data` to `endpoint` exactly once, without retry.
    ///
    /// An absent endpoint performs no I/O and reports `CapabilityUnavailable`.
    pub async fn write<E: Endpoint + ?Sized>(
        endpoint: Option<&E>,
        data: &[u8],
    ) -> Result<WriteOutcome, TransportError> {
        let Some(endpoint) = endpoint else {
            warn!("no writable endpoint, dropping {} byte(s)", data.len());
            return Ok(WriteOutcome::CapabilityUnavailable);
        };
        endpoint.write(data).await?;
        Ok(WriteOutcome::Written(data.len()))
    }
}

/// Options for a print.
///
/// - `max_chunk_bytes`: bytes per write (default: 20)
/// - `inter_segment_delay`: spacing between segment writes (default: 250ms, zero allowed)
/// - `encoding`: what to do with characters above U+00FF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintOptions {
    pub max_chunk_bytes: usize,
    pub inter_segment_delay: Duration,
    pub encoding: EncodingPolicy,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            max_chunk_bytes: WRITE_MAX_CHUNK,
            inter_segment_delay: BASE_DELAY,
            encoding: EncodingPolicy::Truncate,
        }
    }
}

impl PrintOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chunk_bytes(mut self, max_chunk_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes;
        self
    }

    pub fn with_inter_segment_delay(mut self, delay: Duration) -> Self {
        self.inter_segment_delay = delay;
        self
    }

    pub fn with_encoding(mut self, encoding: EncodingPolicy) -> Self {
        self.encoding = encoding;
        self
    }
}

/// Cooperative cancellation for an in-progress print.
///
/// Clones share state. Checked before each segment write; a write already
/// handed to the transport always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Splits a payload into bounded segments and writes them in order.
#[derive(Debug, Clone, Default)]
pub struct ChunkScheduler {
    pub options: PrintOptions,
}

impl ChunkScheduler {
    pub fn new(options: PrintOptions) -> Self {
        Self { options }
    }

    /// Print text through `endpoint`.
    ///
    /// - `endpoint`: writable characteristic, `None` if not connected
    /// - `text`: payload, one byte per character on the wire
    /// - `cancel`: optional signal checked before every write
    ///
    /// Segment `k` is sent no earlier than `k * inter_segment_delay` after the
    /// first write started, and only after segment `k - 1` completed. A
    /// failing write aborts the rest of the payload.
    pub async fn print_text<E: Endpoint + ?Sized>(
        &self,
        endpoint: Option<&E>,
        text: &str,
        cancel: Option<&CancelSignal>,
    ) -> Result<PrintOutcome, PrintError> {
        let Some(endpoint) = endpoint else {
            warn!("print requested without a connected printer, nothing sent");
            return Ok(PrintOutcome::CapabilityUnavailable);
        };

        let chars: Vec<char> = text.chars().collect();
        if self.options.encoding == EncodingPolicy::Strict {
            check_latin1(&chars)?;
        }
        let segments = plan_segments(chars.len(), self.options.max_chunk_bytes)?;
        info!(
            "printing {} byte(s) in {} segment(s)",
            chars.len(),
            segments.len()
        );

        let start = Instant::now();
        let mut bytes = 0;
        for segment in &segments {
            if segment.index > 0 {
                let due = segment_deadline(segment.index, self.options.inter_segment_delay);
                tokio::time::sleep_until(start + due.min(MAX_SEGMENT_WAIT)).await;
            }
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                info!("print cancelled before segment {}", segment.index);
                return Err(PrintError::Cancelled {
                    written: segment.index,
                });
            }

            let data = encode_chars(&chars[segment.range()]);
            debug!(
                "segment {} offset={} len={}",
                segment.index, segment.offset, segment.len
            );
            match CharacteristicWriter::write(Some(endpoint), &data).await {
                Ok(outcome) => bytes += outcome.bytes_written(),
                Err(source) => {
                    warn!("segment {} write failed: {}", segment.index, source);
                    return Err(PrintError::Transport {
                        segment: segment.index,
                        source,
                    });
                }
            }
        }

        info!("print finished ({} segment(s))", segments.len());
        Ok(PrintOutcome::Printed {
            segments: segments.len(),
            bytes,
        })
    }
}

/// A printer connection and the options used to print to it.
///
/// Only one print runs at a time; concurrent calls wait for the one in progress.
pub struct PrintSession<E: Endpoint> {
    endpoint: Option<E>,
    scheduler: ChunkScheduler,
    busy: Mutex<()>,
}

impl<E: Endpoint> PrintSession<E> {
    pub fn new(endpoint: Option<E>, options: PrintOptions) -> Self {
        Self {
            endpoint,
            scheduler: ChunkScheduler::new(options),
            busy: Mutex::new(()),
        }
    }

    /// Session for a resolved endpoint with default options.
    pub fn connected(endpoint: E) -> Self {
        Self::new(Some(endpoint), PrintOptions::default())
    }

    pub fn endpoint(&self) -> Option<&E> {
        self.endpoint.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn options(&self) -> &PrintOptions {
        &self.scheduler.options
    }

    pub fn into_endpoint(self) -> Option<E> {
        self.endpoint
    }

    pub async fn print_text(&self, text: &str) -> Result<PrintOutcome, PrintError> {
        let _guard = self.busy.lock().await;
        self.scheduler
            .print_text(self.endpoint.as_ref(), text, None)
            .await
    }

    pub async fn print_text_with_cancel(
        &self,
        text: &str,
        cancel: &CancelSignal,
    ) -> Result<PrintOutcome, PrintError> {
        let _guard = self.busy.lock().await;
        self.scheduler
            .print_text(self.endpoint.as_ref(), text, Some(cancel))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every write with its start/end time; fails on `fail_at` if set.
    #[derive(Default)]
    struct MockEndpoint {
        writes: StdMutex<Vec<(Vec<u8>, Instant, Instant)>>,
        fail_at: Option<usize>,
        write_time: Duration,
    }

    #[async_trait]
    impl Endpoint for MockEndpoint {
        async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            let begun = Instant::now();
            let attempt = self.writes.lock().unwrap().len();
            if !self.write_time.is_zero() {
                tokio::time::sleep(self.write_time).await;
            }
            self.writes
                .lock()
                .unwrap()
                .push((data.to_vec(), begun, Instant::now()));
            if self.fail_at == Some(attempt) {
                return Err(TransportError::new("gatt error"));
            }
            Ok(())
        }
    }

    impl MockEndpoint {
        fn lens(&self) -> Vec<usize> {
            self.writes.lock().unwrap().iter().map(|w| w.0.len()).collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_absent_endpoint() {
        let out = CharacteristicWriter::write::<MockEndpoint>(None, b"abc")
            .await
            .unwrap();
        assert_eq!(out, WriteOutcome::CapabilityUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_single_write() {
        let ep = MockEndpoint::default();
        let out = CharacteristicWriter::write(Some(&ep), b"abc").await.unwrap();
        assert_eq!(out, WriteOutcome::Written(3));
        assert_eq!(ep.lens(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_payload_single_write_no_delay() {
        let ep = MockEndpoint::default();
        let start = Instant::now();
        let out = ChunkScheduler::default()
            .print_text(Some(&ep), "hello", None)
            .await
            .unwrap();
        assert_eq!(out, PrintOutcome::Printed { segments: 1, bytes: 5 });
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload() {
        let ep = MockEndpoint::default();
        let out = ChunkScheduler::default()
            .print_text(Some(&ep), "", None)
            .await
            .unwrap();
        assert_eq!(out, PrintOutcome::Printed { segments: 0, bytes: 0 });
        assert!(ep.lens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_measured_from_start() {
        // slow writes must not push later segments past their slot
        let ep = MockEndpoint {
            write_time: Duration::from_millis(100),
            ..Default::default()
        };
        let text = "x".repeat(45);
        ChunkScheduler::default()
            .print_text(Some(&ep), &text, None)
            .await
            .unwrap();

        let writes = ep.writes.lock().unwrap();
        let t0 = writes[0].1;
        assert_eq!(writes[1].1 - t0, Duration::from_millis(250));
        assert_eq!(writes[2].1 - t0, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay() {
        let ep = MockEndpoint::default();
        let start = Instant::now();
        let opts = PrintOptions::new().with_inter_segment_delay(Duration::ZERO);
        ChunkScheduler::new(opts)
            .print_text(Some(&ep), &"y".repeat(61), None)
            .await
            .unwrap();
        assert_eq!(ep.lens(), vec![20, 20, 20, 1]);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delay_waits_without_panicking() {
        let ep = MockEndpoint::default();
        let opts = PrintOptions::new().with_inter_segment_delay(Duration::MAX);
        let scheduler = ChunkScheduler::new(opts);
        let text = "z".repeat(21);

        let res = tokio::time::timeout(
            Duration::from_millis(50),
            scheduler.print_text(Some(&ep), &text, None),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(ep.lens(), vec![20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_encoding_rejects_before_write() {
        let ep = MockEndpoint::default();
        let opts = PrintOptions::new().with_encoding(EncodingPolicy::Strict);
        let text = format!("{}€", "a".repeat(30));
        let err = ChunkScheduler::new(opts)
            .print_text(Some(&ep), &text, None)
            .await
            .unwrap_err();
        assert_eq!(err, PrintError::Encoding { offset: 30, ch: '€' });
        assert!(ep.lens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_chunk_rejected() {
        let ep = MockEndpoint::default();
        let opts = PrintOptions::new().with_max_chunk_bytes(0);
        let err = ChunkScheduler::new(opts)
            .print_text(Some(&ep), "abc", None)
            .await
            .unwrap_err();
        assert_eq!(err, PrintError::InvalidChunkSize);
        assert!(ep.lens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_write() {
        let ep = MockEndpoint::default();
        let cancel = CancelSignal::new();
        cancel.cancel();
        let err = ChunkScheduler::default()
            .print_text(Some(&ep), "abc", Some(&cancel))
            .await
            .unwrap_err();
        assert_eq!(err, PrintError::Cancelled { written: 0 });
        assert!(ep.lens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_serializes_prints() {
        let session = PrintSession::connected(MockEndpoint {
            write_time: Duration::from_millis(10),
            ..Default::default()
        });
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        let (ra, rb) = tokio::join!(session.print_text(&a), session.print_text(&b));
        assert!(ra.unwrap().is_printed());
        assert!(rb.unwrap().is_printed());

        let writes = session.endpoint().unwrap().writes.lock().unwrap();
        let firsts: Vec<u8> = writes.iter().map(|w| w.0[0]).collect();
        assert_eq!(firsts, vec![b'a', b'a', b'b', b'b']);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_without_endpoint() {
        let session: PrintSession<MockEndpoint> = PrintSession::new(None, PrintOptions::default());
        assert!(!session.is_connected());
        let out = session.print_text("anything").await.unwrap();
        assert_eq!(out, PrintOutcome::CapabilityUnavailable);
    }
}
