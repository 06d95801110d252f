//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use derive_new::new;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::{Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::bird::{Export, RouteSink};
use crate::error::Error;
use crate::proto;
use crate::proto::route_service_client::RouteServiceClient;
use crate::rib::RibRoute;

// Feed stream reconnection backoff cap.
const STREAM_BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(30);
// Export reader restart backoff cap.
const RUN_BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(60);
// A reader that ran longer than this before failing resets the restart
// backoff.
const BACKOFF_RESET_TIMEOUT: Duration = Duration::from_secs(600);

// Update sends block once this many updates are in flight.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

// Client connection to the Route service gateway.
//
// Closing is a signal only: it marks the connection so the import
// supervisor terminates at its next preflight check, and the transport is
// released when the supervisor drops the channel.
#[derive(Clone)]
pub(crate) struct Gateway {
    channel: Channel,
    closed: Arc<AtomicBool>,
}

// Close handle kept by the import registry. Holds no transport resources.
#[derive(Debug)]
pub(crate) struct ConnHandle(Arc<AtomicBool>);

// Active feed stream to the Route service.
//
// The server half of the stream carries a single summary, delivered once
// the update half is closed.
pub(crate) struct FeedStream {
    tx: mpsc::Sender<proto::Update>,
    summary: Streaming<proto::UpdateSummary>,
}

// Slot holding the active feed stream, shared between the import
// supervisor and the forwarder callbacks. The supervisor only writes it
// while the export reader is paused, and the callbacks only read it while
// the reader is running, so the lock is never contended across I/O.
#[derive(Default)]
pub(crate) struct StreamSlot(Mutex<Option<FeedStream>>);

// Forwards export reader events to the Route service: route batches onto
// the feed stream, flush barriers as unary FlushRoutes calls.
#[derive(new)]
pub(crate) struct RibForwarder {
    target: proto::RibTarget,
    client: RouteServiceClient<Channel>,
    slot: Arc<StreamSlot>,
    cancel: CancellationToken,
}

// Per-import supervisor. Runs the export reader, re-establishes the feed
// stream after transient failures and terminates on cancellation, quit or
// a closed gateway connection.
#[derive(new)]
pub(crate) struct ImportTask {
    export: Export,
    client: RouteServiceClient<Channel>,
    gateway: Gateway,
    slot: Arc<StreamSlot>,
    cancel: CancellationToken,
    quit: CancellationToken,
}

// ===== impl Gateway =====

impl Gateway {
    pub(crate) fn connect(endpoint: &str) -> Result<Gateway, Error> {
        let endpoint = Endpoint::from_shared(endpoint.to_owned())
            .map_err(|_| Error::InvalidEndpoint(endpoint.to_owned()))?;

        Ok(Gateway {
            // Dialing is lazy; failures surface on the first RPC.
            channel: endpoint.connect_lazy(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub(crate) fn handle(&self) -> ConnHandle {
        ConnHandle(self.closed.clone())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ===== impl ConnHandle =====

impl ConnHandle {
    pub(crate) fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

// ===== impl FeedStream =====

impl FeedStream {
    // Opens a new feed stream. The call resolving successfully means the
    // server accepted the stream.
    pub(crate) async fn open(
        client: &mut RouteServiceClient<Channel>,
    ) -> Result<FeedStream, Status> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let response = client.feed_rib(ReceiverStream::new(rx)).await?;

        Ok(FeedStream {
            tx,
            summary: response.into_inner(),
        })
    }

    // Closes the update half of the stream and awaits the summary.
    pub(crate) async fn close_and_recv(mut self) -> Result<proto::UpdateSummary, Status> {
        drop(self.tx);
        match self.summary.message().await? {
            Some(summary) => Ok(summary),
            None => Err(Status::internal("feed stream closed without a summary")),
        }
    }
}

// ===== impl StreamSlot =====

impl StreamSlot {
    pub(crate) fn replace(&self, stream: FeedStream) {
        *self.0.lock().unwrap() = Some(stream);
    }

    pub(crate) fn take(&self) -> Option<FeedStream> {
        self.0.lock().unwrap().take()
    }

    fn sender(&self) -> Option<mpsc::Sender<proto::Update>> {
        self.0.lock().unwrap().as_ref().map(|stream| stream.tx.clone())
    }
}

// ===== impl RibForwarder =====

#[async_trait]
impl RouteSink for RibForwarder {
    async fn on_update(&self, routes: Vec<RibRoute>) -> Result<(), Error> {
        debug!(count = routes.len(), "processing BIRD route batch");
        for route in routes {
            if self.cancel.is_cancelled() {
                warn!("update send cancelled, closing feed stream");
                let close_error = match self.slot.take() {
                    Some(stream) => stream.close_and_recv().await.err(),
                    None => None,
                };
                // Signals the supervisor that the stream is already
                // closed.
                return Err(Error::SendCancelled(close_error));
            }

            let Some(tx) = self.slot.sender() else {
                return Err(Error::StreamClosed);
            };
            let update = proto::Update {
                target: Some(self.target.clone()),
                is_delete: route.to_remove,
                route: Some(proto::RouteRecord::from(&route)),
            };
            if tx.send(update).await.is_err() {
                // Stops the export reader; the supervisor classifies the
                // failure and retries.
                return Err(Error::StreamSend(route.prefix));
            }
        }

        Ok(())
    }

    async fn on_flush(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request = proto::FlushRoutesRequest {
            target: Some(self.target.clone()),
        };
        let mut client = self.client.clone();
        client
            .flush_routes(request)
            .await
            .map_err(Error::FlushRoutes)?;

        Ok(())
    }
}

// ===== impl ImportTask =====

impl ImportTask {
    pub(crate) async fn run(mut self) {
        self.run_loop().await;

        info!("import loop cleanup, cancelling context and closing connection");
        self.cancel.cancel();
        self.gateway.close();
    }

    async fn run_loop(&mut self) {
        let mut backoff = ExponentialBackoff::with_max_interval(RUN_BACKOFF_MAX_INTERVAL);
        let mut stream_active = true;

        loop {
            if self.cancel.is_cancelled() {
                info!("import loop cancelled");
                return;
            }
            if self.quit.is_cancelled() {
                info!("import loop stopping due to service quit signal");
                return;
            }
            if self.gateway.is_closed() {
                error!("gateway connection is closed, terminating import loop");
                return;
            }

            if !stream_active {
                if !self.reconnect().await {
                    info!("stream reconnection aborted, terminating import loop");
                    return;
                }
                stream_active = true;
            }

            info!("starting BIRD export reader");
            let started = Instant::now();
            match self.export.run(&self.cancel).await {
                Ok(()) => {
                    info!("BIRD export reader finished cleanly, terminating import loop");
                    return;
                }
                Err(error) => {
                    warn!(%error, "BIRD export reader stopped");
                    stream_active = false;

                    if error.is_cancellation() {
                        warn!("BIRD export reader cancelled, terminating import loop");
                        return;
                    }

                    if !error.stream_closed() {
                        if let Some(stream) = self.slot.take() {
                            info!("closing feed stream after export reader error");
                            if let Err(error) = stream.close_and_recv().await {
                                warn!(%error, "failed to close feed stream");
                            }
                        }
                    }

                    if started.elapsed() > BACKOFF_RESET_TIMEOUT {
                        backoff.reset();
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            info!("import loop cancelled");
                            return;
                        }
                        _ = self.quit.cancelled() => {
                            info!("import loop stopping due to service quit signal");
                            return;
                        }
                        _ = time::sleep(backoff.next()) => {}
                    }
                }
            }
        }
    }

    // Re-establishes the feed stream under exponential backoff. Returns
    // false if aborted by cancellation or the quit signal, leaving the
    // stream slot untouched.
    async fn reconnect(&mut self) -> bool {
        info!("re-establishing route update stream");
        let mut backoff = ExponentialBackoff::with_max_interval(STREAM_BACKOFF_MAX_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!("stream reconnection aborted by import cancellation");
                    return false;
                }
                _ = self.quit.cancelled() => {
                    warn!("stream reconnection aborted by service quit signal");
                    return false;
                }
                _ = time::sleep(backoff.next()) => {
                    match FeedStream::open(&mut self.client).await {
                        Ok(stream) => {
                            self.slot.replace(stream);
                            info!("route update stream established");
                            return true;
                        }
                        Err(error) => {
                            warn!(%error, "failed to open feed stream, retrying");
                        }
                    }
                }
            }
        }
    }
}

// ===== tests =====
