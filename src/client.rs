use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, Notify};

use torq_klvm::{
    ActorRef, ActorRefObj, Address, Complete, Envelope, EnvelopeMessage, Literal, RequestId,
};

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

fn next_client_address(kind: &str) -> Address {
    Address::new(&format!(
        "{kind}-{}",
        NEXT_CLIENT.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Sends one request into the actor world and awaits its single response.
/// The response value may be a failed value; callers inspect it.
pub struct RequestClient;

impl RequestClient {
    pub fn builder() -> RequestClientBuilder {
        RequestClientBuilder { address: None }
    }
}

pub struct RequestClientBuilder {
    address: Option<Address>,
}

impl RequestClientBuilder {
    pub fn set_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn send(self, actor: &ActorRefObj, message: Complete) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let requester = Arc::new(ResponseInbox {
            address: self
                .address
                .unwrap_or_else(|| next_client_address("request-client")),
            tx: Mutex::new(Some(tx)),
        });
        actor
            .referent()
            .send(Envelope::request(message, requester, RequestId::Nothing));
        PendingResponse { rx }
    }

    pub async fn send_and_await_response(
        self,
        actor: &ActorRefObj,
        message: Complete,
        timeout: Duration,
    ) -> Result<Complete> {
        self.send(actor, message).await_response(timeout).await
    }
}

pub struct PendingResponse {
    rx: oneshot::Receiver<Complete>,
}

impl PendingResponse {
    pub async fn await_response(self, timeout: Duration) -> Result<Complete> {
        tokio::time::timeout(timeout, self.rx)
            .await
            .context("timed out awaiting a response")?
            .context("the responder dropped the request")
    }
}

#[derive(Debug)]
struct ResponseInbox {
    address: Address,
    tx: Mutex<Option<oneshot::Sender<Complete>>>,
}

impl ActorRef for ResponseInbox {
    fn address(&self) -> &Address {
        &self.address
    }

    fn send(&self, envelope: Envelope) {
        if !envelope.is_response() {
            return;
        }
        if let EnvelopeMessage::Value(value) = envelope.message() {
            if let Some(tx) = self.tx.lock().expect("response inbox lock").take() {
                let _ = tx.send(value.clone());
            }
        }
    }
}

/// Collects the stream of response envelopes for one request until an
/// `eof`-labeled record arrives.
pub struct StreamClient;

impl StreamClient {
    pub fn builder() -> StreamClientBuilder {
        StreamClientBuilder { address: None }
    }
}

pub struct StreamClientBuilder {
    address: Option<Address>,
}

impl StreamClientBuilder {
    pub fn set_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn send(self, actor: &ActorRefObj, message: Complete) -> PendingStream {
        let inbox = Arc::new(StreamInbox {
            address: self
                .address
                .unwrap_or_else(|| next_client_address("stream-client")),
            envelopes: Mutex::new(Vec::new()),
            eof_seen: AtomicBool::new(false),
            eof: Notify::new(),
        });
        actor.referent().send(Envelope::request(
            message,
            inbox.clone(),
            RequestId::Nothing,
        ));
        PendingStream { inbox }
    }
}

pub struct PendingStream {
    inbox: Arc<StreamInbox>,
}

impl PendingStream {
    /// Await the terminal `eof` record, then return every received
    /// envelope in arrival order.
    pub async fn await_eof(self, timeout: Duration) -> Result<Vec<Envelope>> {
        tokio::time::timeout(timeout, async {
            while !self.inbox.eof_seen.load(Ordering::Acquire) {
                self.inbox.eof.notified().await;
            }
        })
        .await
        .context("timed out awaiting eof")?;
        let envelopes = self.inbox.envelopes.lock().expect("stream inbox lock");
        Ok(envelopes.clone())
    }
}

#[derive(Debug)]
struct StreamInbox {
    address: Address,
    envelopes: Mutex<Vec<Envelope>>,
    eof_seen: AtomicBool,
    eof: Notify,
}

impl ActorRef for StreamInbox {
    fn address(&self) -> &Address {
        &self.address
    }

    fn send(&self, envelope: Envelope) {
        let eof = matches!(
            envelope.value(),
            Some(Complete::Rec(rec)) if rec.label() == &Literal::Eof
        );
        self.envelopes
            .lock()
            .expect("stream inbox lock")
            .push(envelope);
        if eof {
            self.eof_seen.store(true, Ordering::Release);
            self.eof.notify_one();
        }
    }
}
