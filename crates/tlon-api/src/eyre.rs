//! [`ShipTransport`] over a ship's eyre HTTP interface.
//!
//! Eyre multiplexes everything on one "channel": actions (pokes,
//! subscribes, acks) are `PUT` as JSON arrays to `/~/channel/{uid}`, and
//! a single server-sent-event stream on the same URL carries the answers.
//! A reader task parses that stream and routes poke acks by request id and
//! subscription diffs by subscription id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tlon_shared::protocol::{Poke, ShipEvent};
use tlon_shared::Ship;

use crate::error::{ApiError, Result};
use crate::transport::{ShipTransport, TransportEvent, TransportSubscription};

/// Ack the event stream after this many events.
const ACK_EVERY: u64 = 20;

#[derive(Debug, Clone)]
pub struct EyreConfig {
    /// Base URL of the ship, e.g. `http://localhost:8080`.
    pub url: String,
    pub ship: Ship,
    /// `+code`; `None` when a session cookie is already valid.
    pub access_code: Option<String>,
}

struct ChannelState {
    uid: String,
    reader_running: bool,
    last_acked: u64,
}

struct Inner {
    http: reqwest::Client,
    url: String,
    ship: Ship,
    next_id: AtomicU64,
    channel: Mutex<ChannelState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<()>>>>,
    subscriptions: Mutex<HashMap<u64, (String, mpsc::Sender<TransportEvent>)>>,
}

#[derive(Clone)]
pub struct EyreTransport {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn new_channel_uid() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{secs}-{}", hex::encode(rand::random::<u32>().to_be_bytes()))
}

impl EyreTransport {
    /// Build the HTTP client and log in with the access code, if any.
    pub async fn connect(config: EyreConfig) -> Result<Self> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        let url = config.url.trim_end_matches('/').to_string();

        if let Some(code) = &config.access_code {
            let resp = http
                .post(format!("{url}/~/login"))
                .form(&[("password", code.as_str())])
                .send()
                .await?;
            if !resp.status().is_success() && !resp.status().is_redirection() {
                return Err(ApiError::Auth(format!("login returned {}", resp.status())));
            }
            info!(ship = %config.ship, "logged in to ship");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                url,
                ship: config.ship,
                next_id: AtomicU64::new(1),
                channel: Mutex::new(ChannelState {
                    uid: new_channel_uid(),
                    reader_running: false,
                    last_acked: 0,
                }),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send actions, then make sure the event stream is being read.
    async fn put(&self, actions: Vec<Value>) -> Result<()> {
        self.inner.put(actions).await?;
        self.ensure_reader();
        Ok(())
    }

    fn ensure_reader(&self) {
        let uid = {
            let mut channel = lock(&self.inner.channel);
            if channel.reader_running {
                return;
            }
            channel.reader_running = true;
            channel.uid.clone()
        };
        tokio::spawn(read_stream(self.inner.clone(), uid));
    }

    fn expect_ack(&self, id: u64) -> AckWait {
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);
        AckWait {
            id,
            rx,
            inner: self.inner.clone(),
        }
    }
}

/// A request waiting for its ack. Dropping it, for instance when the caller
/// gives up waiting, forgets the request.
struct AckWait {
    id: u64,
    rx: oneshot::Receiver<Result<()>>,
    inner: Arc<Inner>,
}

impl AckWait {
    async fn wait(mut self) -> Result<()> {
        (&mut self.rx).await.unwrap_or(Err(ApiError::Closed))
    }
}

impl Drop for AckWait {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

impl Inner {
    fn channel_url(&self) -> String {
        format!("{}/~/channel/{}", self.url, lock(&self.channel).uid)
    }

    async fn put(&self, actions: Vec<Value>) -> Result<()> {
        let url = self.channel_url();
        let resp = self.http.put(&url).json(&actions).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status {
                status: resp.status().as_u16(),
                path: url,
            });
        }
        Ok(())
    }

    async fn ack(&self, event_id: u64) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let action = json!({"id": id, "action": "ack", "event-id": event_id});
        if let Err(e) = self.put(vec![action]).await {
            debug!(event_id, error = %e, "event ack failed");
        }
    }

    async fn dispatch(&self, data: &str) {
        let message: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed channel event");
                return;
            }
        };
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            return;
        };
        let response = message.get("response").and_then(Value::as_str).unwrap_or("");

        match response {
            "poke" | "subscribe" => {
                let result = match message.get("err") {
                    Some(err) => Err(ApiError::Rejected(
                        err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string()),
                    )),
                    None => Ok(()),
                };
                if response == "subscribe" && result.is_err() {
                    lock(&self.subscriptions).remove(&id);
                }
                if let Some(tx) = lock(&self.pending).remove(&id) {
                    let _ = tx.send(result);
                }
            }
            "diff" => {
                let target = lock(&self.subscriptions).get(&id).cloned();
                if let Some((app, tx)) = target {
                    let event = ShipEvent {
                        app,
                        mark: message
                            .get("mark")
                            .and_then(Value::as_str)
                            .unwrap_or("json")
                            .to_string(),
                        json: message.get("json").cloned().unwrap_or(Value::Null),
                    };
                    let _ = tx.send(TransportEvent::Event(event)).await;
                }
            }
            "quit" => {
                let target = lock(&self.subscriptions).remove(&id);
                if let Some((_, tx)) = target {
                    let _ = tx.send(TransportEvent::Quit).await;
                }
            }
            other => debug!(id, response = other, "ignoring channel event"),
        }
    }

    /// The stream is gone: fail waiting requests, drop subscription senders
    /// (their receivers see the end of stream) and start a fresh channel.
    fn reset_channel(&self) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(ApiError::Closed));
        }
        lock(&self.subscriptions).clear();

        let mut channel = lock(&self.channel);
        channel.uid = new_channel_uid();
        channel.reader_running = false;
        channel.last_acked = 0;
    }
}

async fn read_stream(inner: Arc<Inner>, uid: String) {
    let url = format!("{}/~/channel/{uid}", inner.url);
    debug!(%url, "opening event stream");

    let resp = match inner.http.get(&url).header(ACCEPT, "text/event-stream").send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            warn!(status = %resp.status(), "event stream refused");
            inner.reset_channel();
            return;
        }
        Err(e) => {
            warn!(error = %e, "event stream failed to open");
            inner.reset_channel();
            return;
        }
    };

    let mut stream = resp.bytes_stream();
    let mut buffer = SseBuffer::default();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "event stream error");
                break;
            }
        };
        buffer.push(&chunk);

        while let Some(block) = buffer.next_block() {
            let block = match block {
                Ok(block) => block,
                Err(e) => {
                    warn!(error = %e, "skipping event that is not UTF-8");
                    continue;
                }
            };
            let Some(sse) = parse_sse(&block) else {
                continue;
            };
            inner.dispatch(&sse.data).await;

            if let Some(event_id) = sse.id {
                let due = {
                    let mut channel = lock(&inner.channel);
                    if event_id >= channel.last_acked + ACK_EVERY {
                        channel.last_acked = event_id;
                        true
                    } else {
                        false
                    }
                };
                if due {
                    inner.ack(event_id).await;
                }
            }
        }
    }

    info!("event stream ended");
    inner.reset_channel();
}

/// Raw stream bytes, split into complete event blocks. Blocks are decoded
/// only once whole, so a character split between chunks survives.
#[derive(Default)]
struct SseBuffer {
    bytes: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) {
        // Lines end in `\n` or `\r\n`; a CR is never part of a multi-byte
        // character, so dropping them all is safe.
        self.bytes.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    fn next_block(&mut self) -> Option<std::result::Result<String, std::string::FromUtf8Error>> {
        let end = self.bytes.windows(2).position(|w| w == b"\n\n")?;
        let block: Vec<u8> = self.bytes.drain(..end + 2).collect();
        Some(String::from_utf8(block))
    }
}

#[derive(Debug, PartialEq)]
struct SseEvent {
    id: Option<u64>,
    data: String,
}

/// Parse one `\n\n`-terminated server-sent-event block.
fn parse_sse(block: &str) -> Option<SseEvent> {
    let mut id = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("id:") {
            id = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        id,
        data: data.join("\n"),
    })
}

#[async_trait]
impl ShipTransport for EyreTransport {
    async fn poke(&self, poke: &Poke) -> Result<()> {
        let id = self.next_id();
        let ack = self.expect_ack(id);

        let action = json!({
            "id": id,
            "action": "poke",
            "ship": self.inner.ship.without_sig(),
            "app": poke.app,
            "mark": poke.mark,
            "json": poke.json,
        });
        self.put(vec![action]).await?;
        ack.wait().await
    }

    async fn scry(&self, app: &str, path: &str) -> Result<Value> {
        let url = format!("{}/~/scry/{app}{path}.json", self.inner.url);
        let resp = self.inner.http.get(&url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(format!("{app}{path}"))),
            status if !status.is_success() => Err(ApiError::Status {
                status: status.as_u16(),
                path: format!("{app}{path}"),
            }),
            _ => Ok(resp.json().await?),
        }
    }

    async fn subscribe(&self, app: &str, path: &str) -> Result<TransportSubscription> {
        let id = self.next_id();
        let ack = self.expect_ack(id);
        let (tx, events) = mpsc::channel(256);
        lock(&self.inner.subscriptions).insert(id, (app.to_string(), tx));

        let action = json!({
            "id": id,
            "action": "subscribe",
            "ship": self.inner.ship.without_sig(),
            "app": app,
            "path": path,
        });
        let result = match self.put(vec![action]).await {
            Ok(()) => ack.wait().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            lock(&self.inner.subscriptions).remove(&id);
            return Err(e);
        }
        Ok(TransportSubscription { id, events })
    }

    async fn unsubscribe(&self, id: u64) -> Result<()> {
        lock(&self.inner.subscriptions).remove(&id);
        let action = json!({
            "id": self.next_id(),
            "action": "unsubscribe",
            "subscription": id,
        });
        self.put(vec![action]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sse_blocks() {
        let block = "id: 7\ndata: {\"id\":1,\"response\":\"poke\",\"ok\":\"ok\"}\n\n";
        assert_eq!(
            parse_sse(block),
            Some(SseEvent {
                id: Some(7),
                data: "{\"id\":1,\"response\":\"poke\",\"ok\":\"ok\"}".to_string(),
            })
        );
        assert_eq!(parse_sse(": keep-alive\n\n"), None);
    }

    #[test]
    fn split_characters_and_crlf_survive_chunking() {
        let block = "id: 3\r\ndata: {\"text\":\"😀\"}\r\n\r\n".as_bytes();
        let split = block.iter().position(|b| *b == 0xF0).unwrap() + 2;

        let mut buffer = SseBuffer::default();
        buffer.push(&block[..split]);
        assert!(buffer.next_block().is_none());
        buffer.push(&block[split..]);

        let block = buffer.next_block().unwrap().unwrap();
        let sse = parse_sse(&block).unwrap();
        assert_eq!(sse.id, Some(3));
        assert_eq!(sse.data, "{\"text\":\"😀\"}");
        assert!(buffer.next_block().is_none());
    }

    #[test]
    fn invalid_utf8_block_is_reported_and_dropped() {
        let mut buffer = SseBuffer::default();
        buffer.push(b"data: \xFF\n\ndata: ok\n\n");
        assert!(buffer.next_block().unwrap().is_err());
        assert_eq!(buffer.next_block().unwrap().unwrap(), "data: ok\n\n");
    }

    #[tokio::test]
    async fn abandoned_ack_wait_is_forgotten() {
        let transport = EyreTransport::connect(EyreConfig {
            url: "http://localhost:1".into(),
            ship: "~zod".parse().unwrap(),
            access_code: None,
        })
        .await
        .unwrap();

        let wait = transport.expect_ack(9);
        assert!(lock(&transport.inner.pending).contains_key(&9));
        let waited = tokio::time::timeout(std::time::Duration::from_millis(10), wait.wait()).await;
        assert!(waited.is_err());
        assert!(lock(&transport.inner.pending).is_empty());
    }

    #[test]
    fn channel_uids_are_unique() {
        assert_ne!(new_channel_uid(), new_channel_uid());
    }

    #[tokio::test]
    async fn dispatch_routes_acks_and_diffs() {
        let transport = EyreTransport::connect(EyreConfig {
            url: "http://localhost:1".into(),
            ship: "~zod".parse().unwrap(),
            access_code: None,
        })
        .await
        .unwrap();
        let inner = transport.inner.clone();

        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&inner.pending).insert(1, ack_tx);
        inner
            .dispatch(r#"{"id":1,"response":"poke","err":"nope"}"#)
            .await;
        assert!(matches!(ack_rx.await.unwrap(), Err(ApiError::Rejected(r)) if r == "nope"));

        let (tx, mut rx) = mpsc::channel(4);
        lock(&inner.subscriptions).insert(2, ("groups".to_string(), tx));
        inner
            .dispatch(r#"{"id":2,"response":"diff","mark":"group-update","json":{"x":1}}"#)
            .await;
        match rx.recv().await {
            Some(TransportEvent::Event(e)) => {
                assert_eq!(e.app, "groups");
                assert_eq!(e.mark, "group-update");
            }
            other => panic!("unexpected {other:?}"),
        }
        inner.dispatch(r#"{"id":2,"response":"quit"}"#).await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Quit));
    }
}
