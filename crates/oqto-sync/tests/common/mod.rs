//! Test utilities: a scripted transport and event fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use oqto_sync::supervisor::ByteStream;
use oqto_sync::{
    EngineConfig, EventTransport, ServerEndpoint, StaticDiscovery, SyncEngine, TransportError,
};

pub const SERVER_A: &str = "http://127.0.0.1:4096";
pub const SERVER_B: &str = "http://127.0.0.1:4097";
pub const DIR_A: &str = "/work/alpha";
pub const DIR_B: &str = "/work/beta";

/// Feeding end of one accepted stream.
#[derive(Clone)]
pub struct Feed {
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl Feed {
    pub fn raw(&self, bytes: impl Into<Bytes>) {
        self.tx.send(Ok(bytes.into())).unwrap();
    }

    /// One enveloped event as its own frame.
    pub fn event(&self, directory: &str, kind: &str, properties: Value) {
        self.raw(frame(directory, kind, properties));
    }

    pub fn heartbeat(&self) {
        self.raw(bare_frame("server.heartbeat", json!({})));
    }

    pub fn fail(&self, message: &str) {
        self.tx
            .send(Err(TransportError::Stream(message.to_string())))
            .unwrap();
    }
}

/// Transport that serves pre-arranged streams per server. Servers with
/// nothing queued refuse the connection.
#[derive(Default)]
pub struct MockTransport {
    streams: Mutex<HashMap<String, VecDeque<mpsc::UnboundedReceiver<Result<Bytes, TransportError>>>>>,
    opens: AtomicUsize,
}

impl MockTransport {
    pub fn accept(&self, base_url: &str) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap()
            .entry(base_url.to_string())
            .or_default()
            .push_back(rx);
        Feed { tx }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventTransport for MockTransport {
    async fn open(&self, endpoint: &ServerEndpoint) -> Result<ByteStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self
            .streams
            .lock()
            .unwrap()
            .get_mut(&endpoint.base_url)
            .and_then(VecDeque::pop_front);
        match next {
            Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => Err(TransportError::Stream(format!(
                "{} refused the connection",
                endpoint.base_url
            ))),
        }
    }
}

pub fn frame(directory: &str, kind: &str, properties: Value) -> String {
    let body = json!({
        "directory": directory,
        "payload": { "type": kind, "properties": properties }
    });
    format!("data: {body}\n\n")
}

/// A payload without the directory envelope.
pub fn bare_frame(kind: &str, properties: Value) -> String {
    let body = json!({ "type": kind, "properties": properties });
    format!("data: {body}\n\n")
}

pub fn session(id: &str, title: &str) -> Value {
    json!({
        "info": {
            "id": id,
            "title": title,
            "time": { "created": 1_700_000_000_000_i64, "updated": 1_700_000_000_000_i64 }
        }
    })
}

pub struct TestEngine {
    pub engine: SyncEngine,
    pub transport: Arc<MockTransport>,
    pub discovery: Arc<StaticDiscovery>,
}

/// Engine over the mock transport, serving the given endpoints.
pub fn test_engine(endpoints: &[(&str, &str)]) -> TestEngine {
    let transport = Arc::new(MockTransport::default());
    let discovery = Arc::new(StaticDiscovery::new(
        endpoints
            .iter()
            .map(|(url, dir)| ServerEndpoint::new(*url, *dir))
            .collect(),
    ));
    let engine = SyncEngine::start(EngineConfig::default(), discovery.clone(), transport.clone());
    TestEngine {
        engine,
        transport,
        discovery,
    }
}
