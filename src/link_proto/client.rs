use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SdkConfig;
use crate::dispatch::{Dispatched, Dispatcher, PendingJob};
use crate::error::ConfigError;
use crate::link_proto::{
    backoff::Backoff,
    rpc::{Envelope, OutboundMessage, Setup},
    session::Session,
    wire::{self, Frame},
};
use crate::registry::RegistryEvent;

/// Interval of the application-level heartbeat once a session is Ready.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Interval of WebSocket ping frames once a session is Ready.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How a single session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The shutdown token fired.
    Shutdown,
    /// The peer closed the connection.
    Disconnected,
}

/// A client for the eval link WebSocket channel.
///
/// [`LinkClient::listen`] keeps one session alive at a time, reconnecting
/// with exponential backoff until the shutdown token is cancelled.
pub struct LinkClient {
    url: String,
    setup: Setup,
    dispatcher: Dispatcher,
    heartbeat_interval: Duration,
    ping_interval: Duration,
}

impl LinkClient {
    /// Fails only if the configuration cannot produce a session.
    pub fn new(config: &SdkConfig, dispatcher: Dispatcher) -> Result<Self, ConfigError> {
        let api_key = config.require_api_key()?.to_string();
        let url = config.websocket_url()?;

        Ok(Self {
            url,
            setup: Setup {
                api_key,
                environment_name: config.environment_label(),
            },
            dispatcher,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            ping_interval: PING_INTERVAL,
        })
    }

    /// Connect somewhere other than the URL derived from the base path.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run sessions until `shutdown` is cancelled.
    pub async fn listen(&self, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new();

        while !shutdown.is_cancelled() {
            info!(url = %self.url, attempt = backoff.retries() + 1, "connecting to orchestrator");
            match self.run_session(&shutdown, &mut backoff).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => warn!("orchestrator closed the connection"),
                Err(e) => warn!(error = %format!("{e:#}"), "session failed"),
            }

            let delay = backoff.next_delay();
            warn!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("listen loop stopped");
        Ok(())
    }

    /// Run one session from connect to close. Resets `backoff` once Ready.
    pub async fn run_session(
        &self,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        let (mut sink, mut stream) = socket.split();

        let mut session = Session::new();
        let events = self.dispatcher.registry().subscribe();

        let result = async {
            send(&mut sink, &session.open(self.setup.clone()))
                .await
                .context("failed to send setup frame")?;
            self.drive(&mut session, &mut sink, &mut stream, events, shutdown, backoff)
                .await
        }
        .await;

        if session.begin_close() {
            debug!("closing websocket");
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        session.finish_close();
        result
    }

    async fn drive<S, R>(
        &self,
        session: &mut Session,
        sink: &mut S,
        stream: &mut R,
        events: broadcast::Receiver<RegistryEvent>,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let mut events = Some(events);
        let mut heartbeat: Option<Interval> = None;
        let mut ping: Option<Interval> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),

                frame = stream.next() => {
                    let bytes = match frame {
                        None => return Ok(SessionEnd::Disconnected),
                        Some(Err(e)) => return Err(e).context("websocket read failed"),
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(bytes))) => bytes,
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "close frame received");
                            return Ok(SessionEnd::Disconnected);
                        }
                        Some(Ok(_)) => continue,
                    };

                    let (replies, job) = self.handle_frame(session, &bytes);
                    for envelope in replies {
                        send(sink, &envelope).await?;
                    }
                    // Execution requests start only after their confirmation is written.
                    if let Some(job) = job {
                        job.start();
                    }

                    if session.is_ready() && heartbeat.is_none() {
                        backoff.reset();
                        heartbeat = Some(interval_after(self.heartbeat_interval));
                        ping = Some(interval_after(self.ping_interval));
                    }
                }

                event = next_event(&mut events) => match event {
                    Ok(event) => {
                        if let Some(envelope) = session.outbound(event.into_message()) {
                            send(sink, &envelope).await?;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "session missed registry broadcasts");
                    }
                    Err(RecvError::Closed) => events = None,
                },

                _ = tick(&mut heartbeat) => {
                    if let Some(envelope) = session.outbound(OutboundMessage::Heartbeat) {
                        if let Err(e) = send(sink, &envelope).await {
                            warn!(error = %format!("{e:#}"), "heartbeat failed");
                        }
                    }
                }

                _ = tick(&mut ping) => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        debug!(error = %e, "ping failed");
                    }
                }
            }
        }
    }

    /// Decode one frame and return whatever must be written in response,
    /// plus any job to start once it has been written.
    fn handle_frame(
        &self,
        session: &mut Session,
        bytes: &[u8],
    ) -> (Vec<Envelope<OutboundMessage>>, Option<PendingJob>) {
        let envelope = match wire::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return (Vec::new(), None);
            }
        };

        if !session.accepts(envelope.for_peer.as_deref()) {
            warn!(frame_for = ?envelope.for_peer, ours = ?session.plugin_id(), "dropping frame addressed to another peer");
            return (Vec::new(), None);
        }

        match envelope.data {
            Frame::Handshake { plugin_id } => {
                let flushed = session.complete_handshake(plugin_id);
                info!(plugin_id = ?session.plugin_id(), flushed = flushed.len(), "handshake complete");
                (flushed, None)
            }
            Frame::Ignored { kind } => {
                debug!(%kind, "ignoring unknown message type");
                (Vec::new(), None)
            }
            Frame::Message(message) => {
                let Dispatched { reply, job } = self.dispatcher.dispatch(message);
                let replies = reply
                    .and_then(|reply| session.outbound(reply))
                    .into_iter()
                    .collect();
                (replies, job)
            }
        }
    }
}

/// Connect with `config` and serve `dispatcher` until `shutdown` fires.
///
/// A missing API key is reported immediately; every later failure is
/// retried.
pub async fn listen(config: &SdkConfig, dispatcher: Dispatcher, shutdown: CancellationToken) -> Result<()> {
    let client = LinkClient::new(config, dispatcher)?;
    client.listen(shutdown).await
}

async fn send<S>(sink: &mut S, envelope: &Envelope<OutboundMessage>) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = wire::encode(envelope).context("failed to encode frame")?;
    sink.send(Message::Text(text))
        .await
        .context("websocket send failed")
}

fn interval_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<RegistryEvent>>,
) -> Result<RegistryEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
