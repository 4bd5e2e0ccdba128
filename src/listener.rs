//! Passive TCP listeners for vessels and sensors

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use strum::Display;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::Pipeline;

/// Longest line accepted from a device, in bytes
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ListenerKind {
    Vessel,
    Sensor,
}

/// Exponential backoff for binding the listening socket
#[derive(Debug, Clone)]
pub struct BindRetry {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BindRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Next backoff delay, clamped to `max_delay`
pub fn next_delay(current: Duration, retry: &BindRetry) -> Duration {
    let next_ms = (current.as_millis() as f64 * retry.multiplier) as u64;
    Duration::from_millis(next_ms).min(retry.max_delay)
}

pub struct Listener {
    kind: ListenerKind,
    address: String,
    pipeline: Arc<Pipeline>,
    retry: BindRetry,
}

impl Listener {
    pub fn new(kind: ListenerKind, address: impl Into<String>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            kind,
            address: address.into(),
            pipeline,
            retry: BindRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: BindRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Bind the listening socket, retrying with backoff
    ///
    /// Returns `None` once the attempts are exhausted or on cancellation.
    pub async fn bind(&self, cancel: &CancellationToken) -> Option<TcpListener> {
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match TcpListener::bind(&self.address).await {
                Ok(listener) => {
                    info!(kind = %self.kind, address = %self.address, "Listening for connections");
                    return Some(listener);
                }
                Err(e) if attempt >= self.retry.max_attempts => {
                    error!(
                        kind = %self.kind,
                        address = %self.address,
                        attempt,
                        "Giving up binding listener: {}",
                        e
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        kind = %self.kind,
                        address = %self.address,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to bind listener: {}",
                        e
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, &self.retry);
        }
    }

    /// Bind and accept connections until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        if let Some(listener) = self.bind(&cancel).await {
            self.serve(listener, cancel).await;
        }
    }

    /// Accept connections on an already bound socket until cancelled
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(kind = %self.kind, "Listener stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(kind = %self.kind, %peer, "New connection");
                        tokio::spawn(handle_connection(
                            self.kind,
                            self.pipeline.clone(),
                            stream,
                            peer,
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!(kind = %self.kind, "Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    kind: ListenerKind,
    pipeline: Arc<Pipeline>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut framing = VesselFraming::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            next = next_line(&mut lines) => match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(%kind, %peer, "Read error: {}", e);
                    break;
                }
                None => break,
            }
        };

        match kind {
            ListenerKind::Vessel => {
                let Some((call_sign, sentences)) = framing.frame(&line) else {
                    continue;
                };
                for sentence in sentences {
                    if let Err(e) = pipeline.ingest_vessel_line(call_sign, &sentence, None).await {
                        debug!(%peer, "Sentence not ingested: {}", e);
                    }
                }
            }
            ListenerKind::Sensor => {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = pipeline.ingest_sensor_line(&line).await {
                    debug!(%peer, "Sensor payload not ingested: {}", e);
                }
            }
        }
    }

    info!(%kind, %peer, "Connection closed");
}

/// Next complete line from a device, skipping oversized ones
pub(crate) async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut FramedRead<R, LinesCodec>,
) -> Option<io::Result<String>> {
    let mut after_error = false;
    loop {
        match lines.next().await {
            Some(Ok(line)) => return Some(Ok(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("Discarding line longer than {} bytes", MAX_LINE_LENGTH);
                after_error = true;
            }
            Some(Err(LinesCodecError::Io(e))) => return Some(Err(e)),
            // The stream ends once after a decode error; reading resumes on the next poll.
            None if after_error => after_error = false,
            None => return None,
        }
    }
}

/// Per-connection framing of vessel input
///
/// A line of the form `ID,$sentence[,$sentence...]` binds the connection to
/// the vessel `ID`; later lines that are bare sentences belong to that vessel.
#[derive(Debug, Default)]
pub struct VesselFraming {
    call_sign: Option<String>,
}

impl VesselFraming {
    /// Vessel and sentences carried by one line
    ///
    /// Returns `None` for empty lines, envelopes without an ID and sentences
    /// received before any envelope.
    pub fn frame(&mut self, line: &str) -> Option<(&str, Vec<String>)> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let sentences = if line.starts_with('$') {
            if self.call_sign.is_none() {
                warn!(line, "Dropping sentence received before any vessel ID");
                return None;
            }
            split_sentences(line)
        } else {
            let (id, rest) = line.split_once(',').unwrap_or((line, ""));
            let id = id.trim();
            if id.is_empty() {
                warn!(line, "Dropping envelope without vessel ID");
                return None;
            }
            if self.call_sign.as_deref() != Some(id) {
                debug!(call_sign = id, "Connection bound to vessel");
                self.call_sign = Some(id.to_string());
            }
            match rest.find('$') {
                Some(start) => split_sentences(&rest[start..]),
                None => Vec::new(),
            }
        };

        self.call_sign.as_deref().map(|call_sign| (call_sign, sentences))
    }

    pub fn call_sign(&self) -> Option<&str> {
        self.call_sign.as_deref()
    }
}

/// Split text at every `$` into individual sentences
fn split_sentences(text: &str) -> Vec<String> {
    text.split('$')
        .map(|part| part.trim().trim_end_matches(',').trim())
        .filter(|part| !part.is_empty())
        .map(|part| format!("${}", part))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_binds_and_splits_sentences() {
        let mut framing = VesselFraming::default();
        let (call_sign, sentences) = framing
            .frame("PKXY,$GPGGA,1,0610.5,S,10649.2,E,1,08,0.9,5.0,M,0.0,M,,*47,$HEHDT,274.5,T\r")
            .unwrap();

        assert_eq!(call_sign, "PKXY");
        assert_eq!(
            sentences,
            vec![
                "$GPGGA,1,0610.5,S,10649.2,E,1,08,0.9,5.0,M,0.0,M,,*47".to_string(),
                "$HEHDT,274.5,T".to_string(),
            ]
        );
    }

    #[test]
    fn bare_sentences_use_bound_vessel() {
        let mut framing = VesselFraming::default();
        assert!(framing.frame("$HEHDT,274.5,T").is_none());

        framing.frame("PKXY,").unwrap();
        let (call_sign, sentences) = framing.frame("$HEHDT,274.5,T").unwrap();
        assert_eq!(call_sign, "PKXY");
        assert_eq!(sentences, vec!["$HEHDT,274.5,T".to_string()]);

        framing.frame("PKAB,$HEHDT,1.0,T").unwrap();
        assert_eq!(framing.call_sign(), Some("PKAB"));
    }

    #[test]
    fn envelope_without_id_is_dropped() {
        let mut framing = VesselFraming::default();
        assert!(framing.frame(",$HEHDT,274.5,T").is_none());
        assert!(framing.frame("   ").is_none());
        assert!(framing.call_sign().is_none());
    }

    #[test]
    fn backoff_sequence_is_capped() {
        let retry = BindRetry::default();
        let mut delay = retry.initial_delay;
        for expected in [1, 2, 4, 8, 16, 30, 30] {
            assert_eq!(delay.as_secs(), expected);
            delay = next_delay(delay, &retry);
        }
    }

    #[tokio::test]
    async fn bind_gives_up_when_address_is_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap().to_string();

        let store = Arc::new(crate::store::MemoryStore::new());
        let cache = Arc::new(
            crate::cache::MetadataCache::load(store.clone(), Duration::from_secs(60))
                .await
                .unwrap(),
        );
        let listener = Listener::new(
            ListenerKind::Vessel,
            address,
            Arc::new(Pipeline::new(cache, store)),
        )
        .with_retry(BindRetry {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_attempts: 3,
        });

        assert!(listener.bind(&CancellationToken::new()).await.is_none());
    }
}
