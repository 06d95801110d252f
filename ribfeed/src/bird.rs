//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::SelectAll;
use futures::{FutureExt, StreamExt};
use ipnetwork::IpNetwork;
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::BirdImportConfig;
use crate::error::Error;
use crate::rib::RibRoute;

// Export feed frame kinds.
const FRAME_UPDATE: u8 = 1;
const FRAME_WITHDRAW: u8 = 2;
const FRAME_FLUSH: u8 = 3;

// Address family identifiers.
const AFI_IPV4: u8 = 1;
const AFI_IPV6: u8 = 2;

const FRAME_HEADER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 256;

// Sink for events produced by the export reader.
//
// Callbacks are invoked sequentially from a single producer; an error
// returned from either callback stops the reader and propagates out of
// `Export::run` unchanged.
#[async_trait]
pub trait RouteSink: Send + Sync {
    async fn on_update(&self, routes: Vec<RibRoute>) -> Result<(), Error>;
    async fn on_flush(&self) -> Result<(), Error>;
}

// Reads and parses the BIRD export feed, delivering route batches and
// flush barriers to the configured sink.
pub struct Export {
    config: BirdImportConfig,
    sink: Arc<dyn RouteSink>,
}

#[derive(Debug)]
enum FeedEvent {
    Route(RibRoute),
    Flush,
}

#[derive(Debug, Default)]
struct FeedDecoder {}

// Export feed decode errors.
#[derive(Debug)]
pub enum DecodeError {
    Read(std::io::Error),
    FrameTooLong(usize),
    IncompleteFrame,
    UnknownFrameKind(u8),
    UnknownAddressFamily(u8),
    InvalidPrefixLength(u8),
}

// ===== impl Export =====

impl Export {
    pub fn new(config: BirdImportConfig, sink: Arc<dyn RouteSink>) -> Export {
        Export { config, sink }
    }

    // Runs the export reader until the feed ends cleanly, an error occurs
    // or the import is cancelled.
    //
    // Route frames accumulate into a batch that is delivered when it
    // reaches the configured batch size, when a flush barrier arrives or
    // when the feed goes idle.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut feeds = SelectAll::new();
        for path in &self.config.sockets {
            let socket = UnixStream::connect(path)
                .await
                .map_err(|error| Error::BirdConnect(path.clone(), error))?;
            feeds.push(FramedRead::with_capacity(
                socket,
                FeedDecoder::default(),
                self.config.read_buffer_size,
            ));
        }
        debug!(sockets = feeds.len(), "reading BIRD export feed");

        let mut batch = Vec::new();
        loop {
            let mut event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = feeds.next() => event,
            };

            loop {
                match event {
                    // All feed sockets reached end of stream.
                    None => {
                        if !batch.is_empty() {
                            self.sink.on_update(mem::take(&mut batch)).await?;
                        }
                        return Ok(());
                    }
                    Some(Err(error)) => return Err(Error::Feed(error)),
                    Some(Ok(FeedEvent::Route(route))) => {
                        batch.push(route);
                        if batch.len() >= self.config.batch_size {
                            self.sink.on_update(mem::take(&mut batch)).await?;
                        }
                    }
                    Some(Ok(FeedEvent::Flush)) => {
                        if !batch.is_empty() {
                            self.sink.on_update(mem::take(&mut batch)).await?;
                        }
                        self.sink.on_flush().await?;
                    }
                }

                // Keep decoding as long as frames are immediately
                // available.
                match feeds.next().now_or_never() {
                    Some(next) => event = next,
                    None => break,
                }
            }

            // The feed went idle; deliver the partial batch.
            if !batch.is_empty() {
                self.sink.on_update(mem::take(&mut batch)).await?;
            }
        }
    }
}

// ===== impl FeedDecoder =====

impl FeedDecoder {
    fn decode_frame(mut frame: Bytes) -> Result<FeedEvent, DecodeError> {
        let kind = get_u8(&mut frame)?;
        match kind {
            FRAME_FLUSH => Ok(FeedEvent::Flush),
            FRAME_UPDATE | FRAME_WITHDRAW => {
                let afi = get_u8(&mut frame)?;
                let prefix_len = get_u8(&mut frame)?;
                let (addr, nexthop) = match afi {
                    AFI_IPV4 => {
                        let addr = get_ipv4(&mut frame)?;
                        let nexthop = get_ipv4(&mut frame)?;
                        (IpAddr::V4(addr), IpAddr::V4(nexthop))
                    }
                    AFI_IPV6 => {
                        let addr = get_ipv6(&mut frame)?;
                        let nexthop = get_ipv6(&mut frame)?;
                        (IpAddr::V6(addr), IpAddr::V6(nexthop))
                    }
                    _ => return Err(DecodeError::UnknownAddressFamily(afi)),
                };
                let prefix = IpNetwork::new(addr, prefix_len)
                    .map_err(|_| DecodeError::InvalidPrefixLength(prefix_len))?;
                let preference = get_u32(&mut frame)?;
                let metric = get_u32(&mut frame)?;

                Ok(FeedEvent::Route(RibRoute {
                    prefix,
                    nexthop,
                    preference,
                    metric,
                    to_remove: kind == FRAME_WITHDRAW,
                }))
            }
            _ => Err(DecodeError::UnknownFrameKind(kind)),
        }
    }
}

impl Decoder for FeedDecoder {
    type Item = FeedEvent;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FeedEvent>, DecodeError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes(src[..FRAME_HEADER_LEN].try_into().unwrap()) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLong(frame_len));
        }
        if src.len() < FRAME_HEADER_LEN + frame_len {
            src.reserve(FRAME_HEADER_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let frame = src.split_to(frame_len).freeze();
        Self::decode_frame(frame).map(Some)
    }
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Read(error) => {
                write!(f, "read error: {}", error)
            }
            DecodeError::FrameTooLong(len) => {
                write!(f, "frame too long: {} bytes", len)
            }
            DecodeError::IncompleteFrame => {
                write!(f, "incomplete frame")
            }
            DecodeError::UnknownFrameKind(kind) => {
                write!(f, "unknown frame kind: {}", kind)
            }
            DecodeError::UnknownAddressFamily(afi) => {
                write!(f, "unknown address family: {}", afi)
            }
            DecodeError::InvalidPrefixLength(len) => {
                write!(f, "invalid prefix length: {}", len)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for DecodeError {
    fn from(error: std::io::Error) -> DecodeError {
        DecodeError::Read(error)
    }
}

// ===== helper functions =====

fn get_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::IncompleteFrame);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::IncompleteFrame);
    }
    Ok(buf.get_u32())
}

fn get_ipv4(buf: &mut Bytes) -> Result<Ipv4Addr, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::IncompleteFrame);
    }
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    Ok(Ipv4Addr::from(octets))
}

fn get_ipv6(buf: &mut Bytes) -> Result<Ipv6Addr, DecodeError> {
    if buf.remaining() < 16 {
        return Err(DecodeError::IncompleteFrame);
    }
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    Ok(Ipv6Addr::from(octets))
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    use super::*;

    fn decode_one(bytes: &[u8]) -> Result<Option<FeedEvent>, DecodeError> {
        let mut decoder = FeedDecoder::default();
        let mut src = BytesMut::from(bytes);
        decoder.decode(&mut src)
    }

    #[test]
    fn decode_ipv4_update() {
        let bytes = [
            0x00, 0x00, 0x00, 0x13, // frame length
            0x01, // update
            0x01, // IPv4
            0x18, // /24
            0x0a, 0x00, 0x00, 0x00, // 10.0.0.0
            0xc0, 0x00, 0x02, 0x01, // 192.0.2.1
            0x00, 0x00, 0x00, 0x64, // preference 100
            0x00, 0x00, 0x00, 0x0a, // metric 10
        ];

        match decode_one(&bytes).unwrap().unwrap() {
            FeedEvent::Route(route) => {
                assert_eq!(route.prefix, "10.0.0.0/24".parse::<IpNetwork>().unwrap());
                assert_eq!(route.nexthop, "192.0.2.1".parse::<IpAddr>().unwrap());
                assert_eq!(route.preference, 100);
                assert_eq!(route.metric, 10);
                assert!(!route.to_remove);
            }
            event => panic!("unexpected event: {:?}", event),
        }
    }

    #[test]
    fn decode_ipv6_withdraw() {
        let bytes = [
            0x00, 0x00, 0x00, 0x2b, // frame length
            0x02, // withdraw
            0x02, // IPv6
            0x20, // /32
            0x20, 0x01, 0x0d, 0xb8, 0x00, 0x00, 0x00, 0x00, // 2001:db8::
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x20, 0x01, 0x0d, 0xb8, 0x00, 0x00, 0x00, 0x00, // 2001:db8::1
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x00, // preference 0
            0x00, 0x00, 0x00, 0x00, // metric 0
        ];

        match decode_one(&bytes).unwrap().unwrap() {
            FeedEvent::Route(route) => {
                assert_eq!(route.prefix, "2001:db8::/32".parse::<IpNetwork>().unwrap());
                assert_eq!(route.nexthop, "2001:db8::1".parse::<IpAddr>().unwrap());
                assert!(route.to_remove);
            }
            event => panic!("unexpected event: {:?}", event),
        }
    }

    #[test]
    fn decode_flush() {
        let bytes = [0x00, 0x00, 0x00, 0x01, 0x03];
        assert!(matches!(
            decode_one(&bytes).unwrap().unwrap(),
            FeedEvent::Flush
        ));
    }

    #[test]
    fn decode_partial_frame() {
        // Header promises more bytes than buffered.
        let bytes = [0x00, 0x00, 0x00, 0x13, 0x01, 0x01];
        assert!(decode_one(&bytes).unwrap().is_none());

        // Not even a full header.
        let bytes = [0x00, 0x00];
        assert!(decode_one(&bytes).unwrap().is_none());
    }

    #[test]
    fn decode_unknown_kind() {
        let bytes = [0x00, 0x00, 0x00, 0x01, 0x7f];
        assert!(matches!(
            decode_one(&bytes),
            Err(DecodeError::UnknownFrameKind(0x7f))
        ));
    }

    #[test]
    fn decode_truncated_route() {
        // Update frame cut short after the address family.
        let bytes = [0x00, 0x00, 0x00, 0x02, 0x01, 0x01];
        assert!(matches!(
            decode_one(&bytes),
            Err(DecodeError::IncompleteFrame)
        ));
    }

    #[test]
    fn decode_oversized_frame() {
        let bytes = [0xff, 0x00, 0x00, 0x00, 0x01];
        assert!(matches!(
            decode_one(&bytes),
            Err(DecodeError::FrameTooLong(..))
        ));
    }

    #[test]
    fn decode_invalid_prefix_length() {
        let bytes = [
            0x00, 0x00, 0x00, 0x13, // frame length
            0x01, // update
            0x01, // IPv4
            0xff, // /255
            0x0a, 0x00, 0x00, 0x00, //
            0xc0, 0x00, 0x02, 0x01, //
            0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
        ];
        assert!(matches!(
            decode_one(&bytes),
            Err(DecodeError::InvalidPrefixLength(0xff))
        ));
    }

    #[derive(Debug, Eq, PartialEq)]
    enum SinkEvent {
        Batch(Vec<IpNetwork>),
        Flush,
    }

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<SinkEvent>>,
    }

    #[async_trait]
    impl RouteSink for RecordingSink {
        async fn on_update(&self, routes: Vec<RibRoute>) -> Result<(), Error> {
            let prefixes = routes.iter().map(|route| route.prefix).collect();
            self.events.lock().unwrap().push(SinkEvent::Batch(prefixes));
            Ok(())
        }

        async fn on_flush(&self) -> Result<(), Error> {
            self.events.lock().unwrap().push(SinkEvent::Flush);
            Ok(())
        }
    }

    fn update_frame(prefix_octets: [u8; 4], prefix_len: u8) -> Vec<u8> {
        let mut body = vec![FRAME_UPDATE, AFI_IPV4, prefix_len];
        body.extend_from_slice(&prefix_octets);
        body.extend_from_slice(&[192, 0, 2, 1]);
        body.extend_from_slice(&100u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());

        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    // Three routes through a reader with a batch size of two: no batch
    // exceeds the limit, order is preserved and EOF ends the run cleanly.
    #[tokio::test]
    async fn reader_batches_and_finishes_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bird.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let config = BirdImportConfig {
            sockets: vec![path],
            batch_size: 2,
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let export = Export::new(config, sink.clone());

        let feeder = tokio::spawn(async move {
            let (mut feed, _) = listener.accept().await.unwrap();
            feed.write_all(&update_frame([10, 0, 0, 0], 24)).await.unwrap();
            feed.write_all(&update_frame([10, 0, 1, 0], 24)).await.unwrap();
            feed.write_all(&update_frame([10, 0, 2, 0], 24)).await.unwrap();
        });

        export.run(&CancellationToken::new()).await.unwrap();
        feeder.await.unwrap();

        let events = sink.events.lock().unwrap();
        let mut prefixes = Vec::new();
        for event in events.iter() {
            match event {
                SinkEvent::Batch(batch) => {
                    assert!(batch.len() <= 2);
                    prefixes.extend(batch.iter().copied());
                }
                SinkEvent::Flush => panic!("unexpected flush"),
            }
        }
        assert_eq!(
            prefixes,
            vec![
                "10.0.0.0/24".parse::<IpNetwork>().unwrap(),
                "10.0.1.0/24".parse::<IpNetwork>().unwrap(),
                "10.0.2.0/24".parse::<IpNetwork>().unwrap(),
            ]
        );
    }

    // A flush barrier delivers the pending batch before the flush
    // callback runs.
    #[tokio::test]
    async fn reader_flushes_pending_batch_on_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bird.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let config = BirdImportConfig {
            sockets: vec![path],
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let export = Export::new(config, sink.clone());

        let feeder = tokio::spawn(async move {
            let (mut feed, _) = listener.accept().await.unwrap();
            let mut bytes = update_frame([10, 0, 0, 0], 24);
            bytes.extend_from_slice(&[0, 0, 0, 1, FRAME_FLUSH]);
            feed.write_all(&bytes).await.unwrap();
        });

        export.run(&CancellationToken::new()).await.unwrap();
        feeder.await.unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                SinkEvent::Batch(vec!["10.0.0.0/24".parse().unwrap()]),
                SinkEvent::Flush,
            ]
        );
    }

    #[tokio::test]
    async fn reader_stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bird.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let config = BirdImportConfig {
            sockets: vec![path],
            ..Default::default()
        };
        let export = Export::new(config, Arc::new(RecordingSink::default()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = export.run(&cancel).await.unwrap_err();
        assert!(error.is_cancellation());
    }

    #[tokio::test]
    async fn reader_fails_on_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = BirdImportConfig {
            sockets: vec![dir.path().join("missing.sock")],
            ..Default::default()
        };
        let export = Export::new(config, Arc::new(RecordingSink::default()));

        let error = export
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::BirdConnect(..)));
    }
}
