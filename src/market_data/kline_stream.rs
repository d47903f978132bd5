// =============================================================================
// Kline Stream Feed — one live subscription, merged into a shared series
// =============================================================================
//
// State machine:  Idle -> Connecting -> Subscribed -> Closing -> Idle
//                 Connecting -> Idle on open failure, readiness timeout or
//                 subscribe failure
//
// Every connection gets a fresh UUID. Inbound messages are tagged with the id
// of the connection that produced them and are merged only while that id is
// still the active one. The id check and the merge run under the same state
// lock that `reconnect` takes to swap ids, so a superseded connection can
// never write into the series registered for its successor.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::candle_series::{parse_string_f64, KlineUpdate, MergeOutcome, SharedSeries};
use crate::error::FeedError;
use crate::runtime_config::FeedConfig;
use crate::types::SubscriptionTarget;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Something the connection produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Error(String),
    Closed,
}

/// A text frame to send, with an acknowledgement once the transport wrote it.
#[derive(Debug)]
pub struct Outbound {
    pub text: String,
    pub ack: oneshot::Sender<Result<(), String>>,
}

/// Channels to one live connection. Dropping `shutdown` (or sending on it)
/// closes the socket.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    pub ready: watch::Receiver<bool>,
    pub shutdown: oneshot::Sender<()>,
}

/// Opens connections. `open` must not wait for the handshake; readiness is
/// reported through [`Link::ready`]. It fails only when the link cannot be
/// set up at all (e.g. an unusable URL).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Link, FeedError>;
}

/// tokio-tungstenite connector: one IO task per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link, FeedError> {
        let request = url
            .into_client_request()
            .map_err(|e| FeedError::Connect(format!("{url}: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(run_link(
            url.to_string(),
            request,
            ready_tx,
            inbound_tx,
            outbound_rx,
            shutdown_rx,
        ));

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            ready: ready_rx,
            shutdown: shutdown_tx,
        })
    }
}

/// Drive one WebSocket until it ends or `shutdown` fires.
async fn run_link(
    url: String,
    request: Request,
    ready: watch::Sender<bool>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: oneshot::Receiver<()>,
) {
    info!(url = %url, "websocket connecting");

    let connected = tokio::select! {
        res = connect_async(request) => res,
        _ = &mut shutdown => {
            debug!(url = %url, "websocket closed before handshake completed");
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            let _ = inbound.send(LinkEvent::Error(e.to_string()));
            let _ = inbound.send(LinkEvent::Closed);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let _ = ready.send(true);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(out) = outbound.recv() => {
                let res = write
                    .send(Message::Text(out.text))
                    .await
                    .map_err(|e| e.to_string());
                let _ = out.ack.send(res);
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(LinkEvent::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket close frame received");
                    break;
                }
                // Ping / Pong / Binary / Frame: tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = inbound.send(LinkEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            }
        }
    }

    let _ = ready.send(false);
    let _ = inbound.send(LinkEvent::Closed);
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Parse a combined-stream kline message for `topic`.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@kline_1m", "data": { "k": { "t": 1700000000000, "o": "1", ... } } }
/// ```
///
/// Returns `Ok(None)` for anything that is not a kline for `topic`
/// (subscribe acks, other streams).
pub fn parse_kline_message(text: &str, topic: &str) -> Result<Option<KlineUpdate>, FeedError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FeedError::MalformedMessage(format!("invalid JSON: {e}")))?;

    let Some(stream) = root.get("stream").and_then(|s| s.as_str()) else {
        return Ok(None);
    };
    if !stream.contains("@kline_") || stream != topic {
        return Ok(None);
    }

    let k = &root["data"]["k"];
    if !k.is_object() {
        return Err(FeedError::MalformedMessage(format!(
            "{stream}: missing field data.k"
        )));
    }

    let open_time = k["t"]
        .as_i64()
        .ok_or_else(|| FeedError::MalformedMessage(format!("{stream}: missing field k.t")))?;

    let field = |name: &str| {
        parse_string_f64(&k[name], &format!("k.{name}"))
            .map_err(|e| FeedError::MalformedMessage(format!("{stream}: {e:#}")))
    };

    Ok(Some(KlineUpdate {
        open_time,
        open: field("o")?,
        high: field("h")?,
        low: field("l")?,
        close: field("c")?,
        volume: field("v")?,
    }))
}

// ---------------------------------------------------------------------------
// StreamFeed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeedStatus {
    Idle,
    Connecting,
    Subscribed,
    Closing,
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// Upper bound on waiting for the connection to report ready.
    pub connect_timeout: Duration,
    /// Interval between readiness polls.
    pub ready_poll: Duration,
}

impl StreamConfig {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            ready_poll: Duration::from_millis(config.ready_poll_ms),
        }
    }
}

/// Handles kept for the active connection.
struct LinkHandle {
    shutdown: oneshot::Sender<()>,
    _outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

impl LinkHandle {
    fn close(self) {
        let _ = self.shutdown.send(());
        self.reader.abort();
    }
}

enum Readiness {
    Ready,
    Superseded,
    TimedOut,
}

struct FeedState {
    status: FeedStatus,
    target: Option<SubscriptionTarget>,
    connection_id: Option<Uuid>,
    series: Option<SharedSeries>,
    link: Option<LinkHandle>,
}

struct FeedShared {
    state: Mutex<FeedState>,
    /// Bumped after every mutation of the registered series.
    changes: watch::Sender<u64>,
}

impl FeedShared {
    fn handle_event(&self, connection_id: Uuid, event: LinkEvent) {
        match event {
            LinkEvent::Text(raw) => {
                self.on_message(connection_id, &raw);
            }
            LinkEvent::Error(err) => self.on_error(connection_id, &err),
            LinkEvent::Closed => self.on_closed(connection_id),
        }
    }

    fn on_message(&self, connection_id: Uuid, raw: &str) -> Option<MergeOutcome> {
        let state = self.state.lock();

        if state.connection_id != Some(connection_id) {
            debug!(connection = %connection_id, "dropping message from superseded connection");
            return None;
        }
        let target = state.target.as_ref()?;

        let update = match parse_kline_message(raw, &target.topic()) {
            Ok(Some(update)) => update,
            Ok(None) => return None,
            Err(e) => {
                warn!(subscription = %target, error = %e, "failed to parse kline message");
                return None;
            }
        };

        let series = state.series.as_ref()?;
        let merged = series.write().merge_update(&update);
        match merged {
            Ok(outcome) => {
                trace!(
                    subscription = %target,
                    open_time = update.open_time,
                    close = update.close,
                    ?outcome,
                    "candle update"
                );
                self.changes.send_modify(|v| *v += 1);
                Some(outcome)
            }
            Err(e) => {
                error!(subscription = %target, error = %e, "kline merge rejected");
                None
            }
        }
    }

    fn on_error(&self, connection_id: Uuid, err: &str) {
        error!(connection = %connection_id, error = %err, "websocket error");
    }

    fn on_closed(&self, connection_id: Uuid) {
        let mut state = self.state.lock();
        if state.connection_id != Some(connection_id) {
            return;
        }
        warn!(
            subscription = ?state.target.as_ref().map(|t| t.to_string()),
            "websocket stream ended"
        );
        // The reader task is the caller; drop its handle without aborting.
        state.link = None;
        state.target = None;
        state.connection_id = None;
        state.status = FeedStatus::Idle;
    }
}

/// Manages the single streaming connection and merges its klines into the
/// registered series.
pub struct StreamFeed<C> {
    connector: C,
    config: StreamConfig,
    shared: Arc<FeedShared>,
}

impl<C: Connector> StreamFeed<C> {
    pub fn new(connector: C, config: StreamConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            connector,
            config,
            shared: Arc::new(FeedShared {
                state: Mutex::new(FeedState {
                    status: FeedStatus::Idle,
                    target: None,
                    connection_id: None,
                    series: None,
                    link: None,
                }),
                changes,
            }),
        }
    }

    /// Register `series` for future merges and make sure the stream is
    /// subscribed to `target`.
    ///
    /// Already subscribed to `target`: only the series reference is swapped.
    /// Otherwise the old connection is closed, a new one opened, readiness
    /// awaited (bounded by `connect_timeout`) and the subscribe request sent.
    /// A call overtaken by a newer `reconnect` or a `close` returns `Ok(())`
    /// as soon as it notices; the newer call owns the outcome.
    pub async fn reconnect(
        &self,
        target: SubscriptionTarget,
        series: SharedSeries,
    ) -> Result<(), FeedError> {
        let connection_id = {
            let mut state = self.shared.state.lock();
            state.series = Some(series);
            self.shared.changes.send_modify(|v| *v += 1);

            if state.status == FeedStatus::Subscribed && state.target.as_ref() == Some(&target) {
                debug!(subscription = %target, "target unchanged, series swapped");
                return Ok(());
            }

            // Soft close: the target and id are replaced before the old socket
            // goes away, so its late messages fail the id check.
            let id = Uuid::new_v4();
            state.target = Some(target.clone());
            state.connection_id = Some(id);
            if let Some(previous) = state.link.take() {
                state.status = FeedStatus::Closing;
                debug!("closing previous websocket");
                previous.close();
            }
            state.status = FeedStatus::Connecting;
            id
        };

        info!(url = %self.config.url, subscription = %target, connection = %connection_id, "websocket connecting");

        let link = match self.connector.open(&self.config.url).await {
            Ok(link) => link,
            Err(e) => {
                self.abandon(connection_id);
                error!(subscription = %target, error = %e, "websocket open failed");
                return Err(e);
            }
        };
        let Link {
            outbound,
            mut inbound,
            ready,
            shutdown,
        } = link;

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                shared.handle_event(connection_id, event);
            }
        });

        {
            let mut state = self.shared.state.lock();
            let handle = LinkHandle {
                shutdown,
                _outbound: outbound.clone(),
                reader,
            };
            if state.connection_id != Some(connection_id) {
                debug!(connection = %connection_id, "connection superseded while opening");
                handle.close();
                return Ok(());
            }
            state.link = Some(handle);
        }

        match self.wait_ready(connection_id, ready).await {
            Readiness::Ready => {}
            Readiness::Superseded => {
                debug!(connection = %connection_id, "connection superseded while waiting for readiness");
                return Ok(());
            }
            Readiness::TimedOut => {
                self.abandon(connection_id);
                error!(subscription = %target, "websocket connection failed");
                return Err(FeedError::ConnectTimeout {
                    timeout_ms: self.config.connect_timeout.as_millis() as u64,
                });
            }
        }

        if let Err(e) = self.subscribe(&outbound, &target).await {
            if !self.is_current(connection_id) {
                debug!(connection = %connection_id, "connection superseded while subscribing");
                return Ok(());
            }
            error!(subscription = %target, error = %e, "websocket subscribe error");
            self.abandon(connection_id);
            return Err(e);
        }

        let mut state = self.shared.state.lock();
        if state.connection_id == Some(connection_id) {
            state.status = FeedStatus::Subscribed;
            info!(subscription = %target, topic = %target.topic(), "websocket connected");
        }
        Ok(())
    }

    fn is_current(&self, connection_id: Uuid) -> bool {
        self.shared.state.lock().connection_id == Some(connection_id)
    }

    /// Poll `ready` every `ready_poll` until it flips, the connection stops
    /// being the active one, or the timeout window is used up.
    async fn wait_ready(&self, connection_id: Uuid, ready: watch::Receiver<bool>) -> Readiness {
        let poll = self.config.ready_poll.max(Duration::from_millis(1));
        let attempts = (self.config.connect_timeout.as_millis() / poll.as_millis()).max(1);
        for _ in 0..attempts {
            if !self.is_current(connection_id) {
                return Readiness::Superseded;
            }
            if *ready.borrow() {
                return Readiness::Ready;
            }
            tokio::time::sleep(poll).await;
        }
        if !self.is_current(connection_id) {
            Readiness::Superseded
        } else if *ready.borrow() {
            Readiness::Ready
        } else {
            Readiness::TimedOut
        }
    }

    async fn subscribe(
        &self,
        outbound: &mpsc::UnboundedSender<Outbound>,
        target: &SubscriptionTarget,
    ) -> Result<(), FeedError> {
        let (ack, acked) = oneshot::channel();
        let sent = outbound
            .send(Outbound {
                text: target.subscribe_message(),
                ack,
            })
            .map_err(|_| FeedError::Subscribe("connection closed".to_string()));

        match sent {
            Ok(()) => acked
                .await
                .map_err(|_| FeedError::Subscribe("connection closed before send".to_string()))
                .and_then(|r| r.map_err(FeedError::Subscribe)),
            Err(e) => Err(e),
        }
    }

    /// Tear down `connection_id` if it is still the active one.
    fn abandon(&self, connection_id: Uuid) {
        let mut state = self.shared.state.lock();
        if state.connection_id != Some(connection_id) {
            return;
        }
        if let Some(link) = state.link.take() {
            link.close();
        }
        state.target = None;
        state.connection_id = None;
        state.status = FeedStatus::Idle;
    }

    /// Close the active connection, if any, and return to Idle. Safe to call
    /// at any time, any number of times.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        let link = state.link.take();
        if link.is_some() || state.target.is_some() {
            state.status = FeedStatus::Closing;
            info!(subscription = ?state.target.as_ref().map(|t| t.to_string()), "websocket closing");
        }
        if let Some(link) = link {
            link.close();
        }
        state.target = None;
        state.connection_id = None;
        state.status = FeedStatus::Idle;
    }

    pub fn status(&self) -> FeedStatus {
        self.shared.state.lock().status
    }

    pub fn active_target(&self) -> Option<SubscriptionTarget> {
        self.shared.state.lock().target.clone()
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.shared.state.lock().connection_id
    }

    /// The series merges currently go into.
    pub fn series(&self) -> Option<SharedSeries> {
        self.shared.state.lock().series.clone()
    }

    /// Change counter, bumped on every series mutation.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }
}

impl<C> Drop for StreamFeed<C> {
    fn drop(&mut self) {
        if let Some(link) = self.shared.state.lock().link.take() {
            link.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::market_data::{Candle, CandleSeries};
    use crate::types::Interval;

    const MINUTE: i64 = 60_000;

    /// In-memory connector that records every network action.
    pub(crate) struct MockConnector {
        pub opens: AtomicUsize,
        pub sent: Arc<Mutex<Vec<String>>>,
        pub inbound: Mutex<Vec<mpsc::UnboundedSender<LinkEvent>>>,
        ready_senders: Mutex<Vec<watch::Sender<bool>>>,
        /// Readiness of newly opened connections.
        pub ready: AtomicBool,
        /// Fail every send on connections opened while set.
        pub fail_send: AtomicBool,
    }

    impl MockConnector {
        pub(crate) fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                sent: Arc::new(Mutex::new(Vec::new())),
                inbound: Mutex::new(Vec::new()),
                ready_senders: Mutex::new(Vec::new()),
                ready: AtomicBool::new(true),
                fail_send: AtomicBool::new(false),
            }
        }

        pub(crate) fn not_ready() -> Self {
            let connector = Self::new();
            connector.ready.store(false, Ordering::SeqCst);
            connector
        }

        /// Flip the `n`th opened connection to ready.
        pub(crate) fn make_ready(&self, n: usize) {
            let _ = self.ready_senders.lock()[n].send(true);
        }

        /// Wait until `n` connections have been opened.
        pub(crate) async fn wait_opens(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(2), async {
                while self.opens.load(Ordering::SeqCst) < n {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("connection never opened");
        }

        /// Opens plus frames sent.
        pub(crate) fn network_actions(&self) -> usize {
            self.opens.load(Ordering::SeqCst) + self.sent.lock().len()
        }

        /// Inbound sender for the `n`th opened connection.
        pub(crate) fn inbound(&self, n: usize) -> mpsc::UnboundedSender<LinkEvent> {
            self.inbound.lock()[n].clone()
        }
    }

    #[async_trait]
    impl Connector for Arc<MockConnector> {
        async fn open(&self, _url: &str) -> Result<Link, FeedError> {
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = watch::channel(self.ready.load(Ordering::SeqCst));
            let (shutdown_tx, _shutdown_rx) = oneshot::channel();

            let sent = self.sent.clone();
            let fail_send = self.fail_send.load(Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(out) = outbound_rx.recv().await {
                    if fail_send {
                        let _ = out.ack.send(Err("broken pipe".to_string()));
                    } else {
                        sent.lock().push(out.text);
                        let _ = out.ack.send(Ok(()));
                    }
                }
            });

            self.inbound.lock().push(inbound_tx);
            self.ready_senders.lock().push(ready_tx);
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Link {
                outbound: outbound_tx,
                inbound: inbound_rx,
                ready: ready_rx,
                shutdown: shutdown_tx,
            })
        }
    }

    pub(crate) fn test_config() -> StreamConfig {
        StreamConfig {
            url: "wss://stream.example/stream".to_string(),
            connect_timeout: Duration::from_millis(50),
            ready_poll: Duration::from_millis(5),
        }
    }

    pub(crate) fn kline_json(topic: &str, t: i64, h: f64, l: f64, c: f64, v: f64) -> String {
        serde_json::json!({
            "stream": topic,
            "data": {
                "e": "kline",
                "k": {
                    "t": t,
                    "o": format!("{c}"),
                    "h": format!("{h}"),
                    "l": format!("{l}"),
                    "c": format!("{c}"),
                    "v": format!("{v}"),
                    "x": false
                }
            }
        })
        .to_string()
    }

    fn series_until(last_minute: i64) -> SharedSeries {
        CandleSeries::from_candles(
            (0..=last_minute)
                .map(|m| Candle::new(m * MINUTE, 100.0, 101.0, 99.0, 100.0, 10.0))
                .collect(),
        )
        .into_shared()
    }

    fn target(symbol: &str) -> SubscriptionTarget {
        SubscriptionTarget::new(symbol, Interval::OneMinute).unwrap()
    }

    async fn wait_change(rx: &mut watch::Receiver<u64>) {
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("no change notification")
            .expect("feed dropped");
    }

    fn feed() -> (Arc<MockConnector>, StreamFeed<Arc<MockConnector>>) {
        let connector = Arc::new(MockConnector::new());
        (connector.clone(), StreamFeed::new(connector, test_config()))
    }

    #[test]
    fn parse_kline_for_topic() {
        let raw = kline_json("btcusdt@kline_1m", 59 * MINUTE, 105.0, 95.0, 102.0, 7.5);
        let u = parse_kline_message(&raw, "btcusdt@kline_1m").unwrap().unwrap();
        assert_eq!(u.open_time, 59 * MINUTE);
        assert_eq!(u.high, 105.0);
        assert_eq!(u.low, 95.0);
        assert_eq!(u.close, 102.0);
        assert_eq!(u.volume, 7.5);
    }

    #[test]
    fn parse_ignores_acks_and_foreign_topics() {
        assert_eq!(parse_kline_message(r#"{"result":null,"id":1}"#, "btcusdt@kline_1m"), Ok(None));
        let raw = kline_json("ethusdt@kline_1m", 0, 1.0, 1.0, 1.0, 1.0);
        assert_eq!(parse_kline_message(&raw, "btcusdt@kline_1m"), Ok(None));
        let trade = r#"{"stream":"btcusdt@aggTrade","data":{"p":"1"}}"#;
        assert_eq!(parse_kline_message(trade, "btcusdt@kline_1m"), Ok(None));
    }

    #[test]
    fn parse_rejects_malformed_klines() {
        let topic = "btcusdt@kline_1m";
        assert!(matches!(
            parse_kline_message("not json", topic),
            Err(FeedError::MalformedMessage(_))
        ));
        let no_k = r#"{"stream":"btcusdt@kline_1m","data":{}}"#;
        assert!(matches!(
            parse_kline_message(no_k, topic),
            Err(FeedError::MalformedMessage(_))
        ));
        let bad_close = r#"{"stream":"btcusdt@kline_1m","data":{"k":{"t":1,"o":"1","h":"1","l":"1","c":"x","v":"1"}}}"#;
        assert!(matches!(
            parse_kline_message(bad_close, topic),
            Err(FeedError::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_subscribes_and_merges() {
        let (connector, feed) = feed();
        let series = series_until(59);
        let mut changes = feed.changes();

        feed.reconnect(target("BTCUSDT"), series.clone()).await.unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();
        assert_eq!(feed.status(), FeedStatus::Subscribed);
        assert_eq!(
            connector.sent.lock().as_slice(),
            [r#"{"method":"SUBSCRIBE","params":["btcusdt@kline_1m"],"id":1}"#.to_string()]
        );

        let inbound = connector.inbound(0);
        inbound
            .send(LinkEvent::Text(kline_json("btcusdt@kline_1m", 59 * MINUTE, 105.0, 95.0, 102.0, 20.0)))
            .unwrap();
        wait_change(&mut changes).await;
        {
            let s = series.read();
            let last = s.last().unwrap();
            assert_eq!((last.high, last.low, last.close), (105.0, 95.0, 102.0));
            assert_eq!(s.len(), 60);
        }

        inbound
            .send(LinkEvent::Text(kline_json("btcusdt@kline_1m", 60 * MINUTE, 103.0, 101.0, 102.0, 1.0)))
            .unwrap();
        wait_change(&mut changes).await;
        assert_eq!(series.read().len(), 61);
        assert_eq!(series.read().last().unwrap().open_time, 60 * MINUTE);
    }

    #[tokio::test]
    async fn same_target_twice_performs_no_network_action() {
        let (connector, feed) = feed();
        feed.reconnect(target("btcusdt"), series_until(3)).await.unwrap();
        let actions = connector.network_actions();

        let replacement = series_until(5);
        feed.reconnect(target("BTCUSDT"), replacement.clone()).await.unwrap();
        assert_eq!(connector.network_actions(), actions);
        assert!(Arc::ptr_eq(&feed.series().unwrap(), &replacement));
        assert_eq!(feed.status(), FeedStatus::Subscribed);
    }

    #[tokio::test]
    async fn superseded_connection_cannot_mutate_new_series() {
        let (connector, feed) = feed();
        let series_a = series_until(10);
        feed.reconnect(target("btcusdt"), series_a.clone()).await.unwrap();
        let old_id = feed.connection_id().unwrap();
        let old_inbound = connector.inbound(0);

        let series_b = series_until(20);
        let before_b = series_b.read().clone();
        feed.reconnect(target("ethusdt"), series_b.clone()).await.unwrap();
        assert_ne!(feed.connection_id(), Some(old_id));

        // Late frames through the old channel, for either topic.
        let _ = old_inbound.send(LinkEvent::Text(kline_json("btcusdt@kline_1m", 20 * MINUTE, 999.0, 1.0, 500.0, 1.0)));
        let _ = old_inbound.send(LinkEvent::Text(kline_json("ethusdt@kline_1m", 20 * MINUTE, 999.0, 1.0, 500.0, 1.0)));
        // Even if the old reader were still running, its id is rejected.
        let raw = kline_json("ethusdt@kline_1m", 21 * MINUTE, 999.0, 1.0, 500.0, 1.0);
        assert_eq!(feed.shared.on_message(old_id, &raw), None);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*series_b.read(), before_b);

        // The new connection still merges.
        let new_id = feed.connection_id().unwrap();
        assert_eq!(feed.shared.on_message(new_id, &raw), Some(MergeOutcome::Appended));
        assert_eq!(series_b.read().len(), 22);
    }

    #[tokio::test]
    async fn messages_for_other_topics_are_ignored() {
        let (_, feed) = feed();
        let series = series_until(1);
        feed.reconnect(target("btcusdt"), series.clone()).await.unwrap();
        let id = feed.connection_id().unwrap();

        let other = kline_json("btcusdt@kline_5m", 2 * MINUTE, 1.0, 1.0, 1.0, 1.0);
        assert_eq!(feed.shared.on_message(id, &other), None);
        assert_eq!(feed.shared.on_message(id, "garbage"), None);
        assert_eq!(series.read().len(), 2);
        assert_eq!(feed.status(), FeedStatus::Subscribed);
    }

    #[tokio::test]
    async fn readiness_timeout_returns_to_idle() {
        let connector = Arc::new(MockConnector::not_ready());
        let feed = StreamFeed::new(connector.clone(), test_config());

        let err = feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap_err();
        assert_eq!(err, FeedError::ConnectTimeout { timeout_ms: 50 });
        assert_eq!(feed.status(), FeedStatus::Idle);
        assert_eq!(feed.active_target(), None);
        assert!(connector.sent.lock().is_empty());

        // A later reconnect to the same target tries again.
        feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap_err();
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscribe_failure_is_surfaced_and_retry_reconnects() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_send.store(true, Ordering::SeqCst);
        let feed = StreamFeed::new(connector.clone(), test_config());

        let err = feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap_err();
        assert_eq!(err, FeedError::Subscribe("broken pipe".to_string()));
        assert_eq!(feed.status(), FeedStatus::Idle);
        assert_eq!(feed.active_target(), None);

        // Same target again: a fresh connection, not a silent no-op.
        connector.fail_send.store(false, Ordering::SeqCst);
        feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap();
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
        assert_eq!(feed.status(), FeedStatus::Subscribed);
        assert_eq!(connector.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn overtaken_reconnect_returns_without_waiting_out_the_timeout() {
        let connector = Arc::new(MockConnector::not_ready());
        let config = StreamConfig {
            connect_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let feed = StreamFeed::new(connector.clone(), config);

        let started = tokio::time::Instant::now();
        let first = async {
            let res = feed.reconnect(target("btcusdt"), series_until(1)).await;
            (res, started.elapsed())
        };
        let second = async {
            connector.wait_opens(1).await;
            feed.reconnect(target("ethusdt"), series_until(1)).await
        };
        let make_second_ready = async {
            connector.wait_opens(2).await;
            connector.make_ready(1);
        };
        let ((first, first_elapsed), second, ()) = tokio::join!(first, second, make_second_ready);

        assert_eq!(first, Ok(()));
        assert!(first_elapsed < Duration::from_secs(1), "took {first_elapsed:?}");
        assert_eq!(second, Ok(()));
        assert_eq!(feed.status(), FeedStatus::Subscribed);
        assert_eq!(feed.active_target(), Some(target("ethusdt")));
        assert_eq!(
            connector.sent.lock().as_slice(),
            [r#"{"method":"SUBSCRIBE","params":["ethusdt@kline_1m"],"id":1}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn same_target_while_connecting_opens_a_fresh_connection() {
        let connector = Arc::new(MockConnector::not_ready());
        let feed = StreamFeed::new(connector.clone(), test_config());

        let first = feed.reconnect(target("btcusdt"), series_until(1));
        let second = async {
            connector.wait_opens(1).await;
            feed.reconnect(target("btcusdt"), series_until(2)).await
        };
        let make_second_ready = async {
            connector.wait_opens(2).await;
            connector.make_ready(1);
        };
        let (first, second, ()) = tokio::join!(first, second, make_second_ready);

        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
        assert_eq!(feed.status(), FeedStatus::Subscribed);
        assert_eq!(feed.series().unwrap().read().len(), 3);
    }

    #[tokio::test]
    async fn ws_connector_rejects_unusable_url() {
        let err = WsConnector.open("not a url").await.unwrap_err();
        assert!(matches!(err, FeedError::Connect(_)));

        let config = StreamConfig {
            url: "not a url".to_string(),
            ..test_config()
        };
        let feed = StreamFeed::new(WsConnector, config);
        let err = feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap_err();
        assert!(matches!(err, FeedError::Connect(_)));
        assert_eq!(feed.status(), FeedStatus::Idle);
        assert_eq!(feed.active_target(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_, feed) = feed();
        feed.close();
        assert_eq!(feed.status(), FeedStatus::Idle);

        feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap();
        feed.close();
        assert_eq!(feed.status(), FeedStatus::Idle);
        feed.close();
        assert_eq!(feed.status(), FeedStatus::Idle);
        assert_eq!(feed.active_target(), None);
    }

    #[tokio::test]
    async fn transport_close_clears_target() {
        let (connector, feed) = feed();
        feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap();

        connector.inbound(0).send(LinkEvent::Error("reset by peer".to_string())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(feed.status(), FeedStatus::Subscribed);

        connector.inbound(0).send(LinkEvent::Closed).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(feed.status(), FeedStatus::Idle);
        assert_eq!(feed.active_target(), None);

        // Same target now reconnects.
        feed.reconnect(target("btcusdt"), series_until(1)).await.unwrap();
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn merge_into_empty_series_is_rejected() {
        let (_, feed) = feed();
        let empty = CandleSeries::default().into_shared();
        feed.reconnect(target("btcusdt"), empty.clone()).await.unwrap();
        let id = feed.connection_id().unwrap();
        let raw = kline_json("btcusdt@kline_1m", 0, 1.0, 1.0, 1.0, 1.0);
        // Empty series: merge rejected, nothing appended.
        assert_eq!(feed.shared.on_message(id, &raw), None);
        assert!(empty.read().is_empty());
    }

    #[tokio::test]
    async fn ws_connector_round_trip_against_local_server() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let subscribe = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            };
            ws.send(Message::Text(r#"{"result":null,"id":1}"#.to_string()))
                .await
                .unwrap();
            ws.send(Message::Text(kline_json("btcusdt@kline_1m", MINUTE, 120.0, 90.0, 110.0, 3.0)))
                .await
                .unwrap();
            // Hold the socket open until the client closes it.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
            subscribe
        });

        let config = StreamConfig {
            url: format!("ws://{addr}"),
            connect_timeout: Duration::from_secs(5),
            ready_poll: Duration::from_millis(10),
        };
        let feed = StreamFeed::new(WsConnector, config);
        let series = series_until(1);
        let mut changes = feed.changes();

        feed.reconnect(target("btcusdt"), series.clone()).await.unwrap();
        // The kline may land before or after `reconnect` returns.
        loop {
            let last_open = series.read().last().map(|c| c.open_time);
            if last_open == Some(MINUTE) {
                break;
            }
            wait_change(&mut changes).await;
        }
        {
            let s = series.read();
            let last = s.last().unwrap();
            assert_eq!((last.open_time, last.high, last.low, last.close), (MINUTE, 120.0, 90.0, 110.0));
        }

        feed.close();
        let subscribe = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(subscribe.contains("btcusdt@kline_1m"));
    }
}
