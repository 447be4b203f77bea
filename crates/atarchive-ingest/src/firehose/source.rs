//! Frame sources for the firehose consumer.
//!
//! The consumer only needs "give me binary frames starting at sequence N".
//! [`WebSocketSource`] does that against a relay's `subscribeRepos` endpoint;
//! tests substitute a scripted source.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::{Error, Result};

/// Stream of raw binary frames from one subscription session.
///
/// The stream ending, or yielding an error, ends the session.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A source of firehose frames.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Open a session whose first frame has sequence `from_sequence`, or the
    /// oldest sequence the upstream still retains when `None`.
    async fn connect(&self, from_sequence: Option<u64>) -> Result<FrameStream>;
}

/// Relay subscription over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketSource {
    relay_url: String,
    connect_timeout: Duration,
}

impl WebSocketSource {
    pub fn new(relay_url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            relay_url: relay_url.into(),
            connect_timeout,
        }
    }

    /// Subscription URL for a session starting at `from_sequence`.
    ///
    /// The protocol's `cursor` means "last sequence already seen", so it is
    /// one less than the first sequence we want. Cursor 0 replays everything
    /// the relay still holds.
    pub fn subscribe_url(&self, from_sequence: Option<u64>) -> String {
        let cursor = from_sequence.map_or(0, |seq| seq.saturating_sub(1));
        format!(
            "{}/xrpc/com.atproto.sync.subscribeRepos?cursor={}",
            self.relay_url.trim_end_matches('/'),
            cursor
        )
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn connect(&self, from_sequence: Option<u64>) -> Result<FrameStream> {
        let url = self.subscribe_url(from_sequence);
        tracing::info!("Connecting to {}", url);

        let (socket, response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| Error::Timeout(self.connect_timeout))??;

        tracing::debug!("Subscription established: HTTP {}", response.status());

        let frames = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Binary(bytes)) => Some(Ok(Vec::from(bytes))),
                Ok(Message::Close(frame)) => Some(Err(Error::TransientNetwork(format!(
                    "closed by relay: {:?}",
                    frame
                )))),
                // Pings are answered by tungstenite itself; text frames are not part of the protocol.
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            }
        });

        Ok(Box::pin(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_url_cursor_is_one_behind() {
        let source = WebSocketSource::new("wss://bsky.network/", Duration::from_secs(5));
        assert_eq!(
            source.subscribe_url(Some(1001)),
            "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos?cursor=1000"
        );
        assert_eq!(
            source.subscribe_url(None),
            "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos?cursor=0"
        );
        assert_eq!(
            source.subscribe_url(Some(0)),
            "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos?cursor=0"
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let source = WebSocketSource::new(format!("ws://127.0.0.1:{port}"), Duration::from_secs(5));
        let err = source.connect(Some(1)).await.err().unwrap();
        assert!(err.is_transient());
    }
}
