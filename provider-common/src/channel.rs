//! Correlation channel multiplexing many requests over one duplex channel
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::wire::{ErrorFrame, Frame, PushPayload, RequestPayload};
use crate::{Error, ErrorKind, Result};

/// Maximum number of concurrently outstanding requests on one channel
pub const REQUEST_POOL_SIZE: usize = 500;

/// Boxed future returned by the registered request listener
pub type ListenerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Callback answering inbound request frames, keyed by their frame id
pub type RequestListener = Box<dyn Fn(u32, RequestPayload) -> ListenerFuture + Send + Sync>;

/// Callback observing inbound push frames
pub type PushListener = Box<dyn Fn(&PushPayload) + Send + Sync>;

type Deferred = oneshot::Sender<std::result::Result<Value, ErrorFrame>>;

/// Outbound half of the physical duplex channel
pub trait FrameSink: Send + Sync {
    /// Transmits one frame; must not block
    fn transmit(&self, frame: Frame) -> Result<()>;
}

/// Bounded pool of request identifiers
///
/// Identifiers are recycled once their request completes; at most
/// [`REQUEST_POOL_SIZE`] may be outstanding at any time.
#[derive(Debug, Default)]
struct IdPool {
    next: u32,
    free: Vec<u32>,
}

impl IdPool {
    fn acquire(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop() {
            return Some(id);
        }

        if (self.next as usize) < REQUEST_POOL_SIZE {
            let id = self.next;
            self.next += 1;
            Some(id)
        } else {
            None
        }
    }

    fn release(&mut self, id: u32) {
        self.free.push(id);
    }
}

#[derive(Default)]
struct ChannelState {
    pending: HashMap<u32, Deferred>,
    ids: IdPool,
    disposed: bool,
}

/// Multiplexes concurrent request/response exchanges over one duplex channel
/// and dispatches unsolicited push frames to listeners
///
/// Responses are matched to requests strictly by id, so out-of-order arrival
/// is attributed correctly. [`CorrelationChannel::dispose`] must run before
/// the physical channel is torn down, otherwise callers hang forever.
pub struct CorrelationChannel<S: FrameSink> {
    sink: S,
    state: Mutex<ChannelState>,
    listener: Mutex<Option<RequestListener>>,
    push_listeners: Mutex<Vec<PushListener>>,
}

impl<S: FrameSink> CorrelationChannel<S> {
    /// Creates a new channel over given frame sink
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: Mutex::new(ChannelState::default()),
            listener: Mutex::new(None),
            push_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers the single callback answering inbound request frames,
    /// replacing any previous one
    pub fn set_request_listener(&self, listener: RequestListener) {
        *self
            .listener
            .lock()
            .expect("Unable to acquire lock on request listener") = Some(listener);
    }

    /// Registers a callback observing inbound push frames
    pub fn add_push_listener(&self, listener: PushListener) {
        self.push_listeners
            .lock()
            .expect("Unable to acquire lock on push listeners")
            .push(listener);
    }

    /// Transmits a push frame with given event name and payload
    pub fn send_event(&self, event: &str, payload: Value) -> Result<()> {
        self.sink.transmit(Frame::Message {
            data: PushPayload {
                event: event.to_string(),
                payload,
            },
        })
    }

    /// Sends a request frame and waits for the matching response
    ///
    /// Fails immediately with [`ErrorKind::LimitExceededError`] (transmitting
    /// nothing) when all [`REQUEST_POOL_SIZE`] identifiers are in flight.
    pub async fn request(&self, data: RequestPayload) -> Result<Value> {
        let (id, receiver) = {
            let mut state = self
                .state
                .lock()
                .expect("Unable to acquire lock on channel state");

            if state.disposed {
                return Err(Error::new(
                    ErrorKind::TransportError,
                    "Channel is disposed",
                ));
            }

            let id = state.ids.acquire().ok_or_else(|| {
                Error::new(
                    ErrorKind::LimitExceededError,
                    "Too many concurrent requests on one channel",
                )
            })?;

            let (sender, receiver) = oneshot::channel();
            state.pending.insert(id, sender);
            (id, receiver)
        };

        if let Err(err) = self.sink.transmit(Frame::Request { id, data }) {
            let mut state = self
                .state
                .lock()
                .expect("Unable to acquire lock on channel state");
            state.pending.remove(&id);
            state.ids.release(id);
            return Err(err);
        }

        match receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(frame)) => Err(frame.into()),
            Err(_) => Err(Error::new(
                ErrorKind::InternalError,
                "Response channel dropped without a value",
            )),
        }
    }

    /// Dispatches one inbound frame
    pub async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response { id, res, err } => self.on_response(id, res, err),
            Frame::Request { id, data } => self.on_request(id, data).await,
            Frame::Message { data } => self.on_message(&data),
        }
    }

    /// Matches a response frame to its pending request; stale or duplicate
    /// ids are a no-op
    fn on_response(&self, id: u32, res: Option<Value>, err: Option<ErrorFrame>) {
        let sender = {
            let mut state = self
                .state
                .lock()
                .expect("Unable to acquire lock on channel state");

            match state.pending.remove(&id) {
                Some(sender) => {
                    state.ids.release(id);
                    sender
                }
                None => {
                    log::warn!("Received a response frame with no pending request: {}", id);
                    return;
                }
            }
        };

        let outcome = match err {
            Some(frame) => Err(frame),
            None => Ok(res.unwrap_or(Value::Null)),
        };

        if sender.send(outcome).is_err() {
            log::debug!("Requester of {} went away before its response arrived", id);
        }
    }

    /// Invokes the registered listener for an inbound request frame and
    /// transmits exactly one response frame with its success value or error
    async fn on_request(&self, id: u32, data: RequestPayload) {
        let future = {
            let listener = self
                .listener
                .lock()
                .expect("Unable to acquire lock on request listener");

            match listener.as_ref() {
                Some(callback) => callback(id, data),
                None => {
                    log::error!("Received a request frame with no registered listener");
                    Box::pin(async {
                        Err(Error::new(
                            ErrorKind::InternalError,
                            "No request listener registered",
                        ))
                    }) as ListenerFuture
                }
            }
        };

        let frame = match future.await {
            Ok(value) => Frame::Response {
                id,
                res: Some(value),
                err: None,
            },
            Err(error) => Frame::Response {
                id,
                res: None,
                err: Some(ErrorFrame::from(&error)),
            },
        };

        if let Err(err) = self.sink.transmit(frame) {
            log::error!("Unable to transmit response frame for {}: {}", id, err);
        }
    }

    fn on_message(&self, data: &PushPayload) {
        let listeners = self
            .push_listeners
            .lock()
            .expect("Unable to acquire lock on push listeners");

        for listener in listeners.iter() {
            listener(data);
        }
    }

    /// Rejects every pending request with a teardown error and clears the
    /// table; must run before the physical channel is torn down
    pub fn dispose(&self) {
        let drained: Vec<(u32, Deferred)> = {
            let mut state = self
                .state
                .lock()
                .expect("Unable to acquire lock on channel state");
            state.disposed = true;
            state.ids = IdPool::default();
            state.pending.drain().collect()
        };

        let teardown = Error::new(
            ErrorKind::UserRejectedError,
            "Channel disposed before response arrived",
        );

        for (id, sender) in drained {
            if sender.send(Err(ErrorFrame::from(&teardown))).is_err() {
                log::debug!("Requester of {} went away before channel disposal", id);
            }
        }
    }

    /// Number of requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("Unable to acquire lock on channel state")
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use serde_json::json;

    /// Records transmitted frames instead of sending them anywhere
    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Frame>>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Frame> {
            std::mem::take(&mut self.frames.lock().unwrap())
        }
    }

    impl FrameSink for RecordingSink {
        fn transmit(&self, frame: Frame) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn payload(method: &str) -> RequestPayload {
        RequestPayload {
            method: method.to_string(),
            params: Value::Null,
        }
    }

    #[tokio::test]
    async fn check_request_response_round_trip() {
        let sink = RecordingSink::default();
        let channel = Arc::new(CorrelationChannel::new(sink.clone()));

        let requester = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(payload("getVersion")).await })
        };

        // wait until the request frame went out
        while sink.frames.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let frames = sink.take();
        let id = match &frames[0] {
            Frame::Request { id, .. } => *id,
            other => panic!("Expected request frame, got {:?}", other),
        };

        channel
            .handle_frame(Frame::Response {
                id,
                res: Some(json!("0.1.0")),
                err: None,
            })
            .await;

        let value = requester.await.unwrap().expect("Request should succeed");
        assert_eq!(json!("0.1.0"), value);
        assert_eq!(0, channel.pending_count());
    }

    #[tokio::test]
    async fn check_pool_bound() {
        struct NullSink;

        impl FrameSink for NullSink {
            fn transmit(&self, _frame: Frame) -> Result<()> {
                Ok(())
            }
        }

        let channel = Arc::new(CorrelationChannel::new(NullSink));

        let mut handles = Vec::with_capacity(REQUEST_POOL_SIZE);
        for _ in 0..REQUEST_POOL_SIZE {
            let channel = channel.clone();
            handles.push(tokio::spawn(
                async move { channel.request(payload("getBalance")).await },
            ));
        }

        while channel.pending_count() < REQUEST_POOL_SIZE {
            tokio::task::yield_now().await;
        }

        // the 501st request fails immediately without transmitting
        let error = channel
            .request(payload("getBalance"))
            .await
            .expect_err("Pool should be exhausted");
        assert_eq!(ErrorKind::LimitExceededError, error.kind());

        // resolving any one frees an id for a new request
        channel
            .handle_frame(Frame::Response {
                id: 0,
                res: Some(Value::Null),
                err: None,
            })
            .await;

        let follow_up = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(payload("getBalance")).await })
        };

        while channel.pending_count() < REQUEST_POOL_SIZE {
            tokio::task::yield_now().await;
        }

        channel.dispose();

        for handle in handles {
            let _ = handle.await.unwrap();
        }
        let _ = follow_up.await.unwrap();
    }

    #[tokio::test]
    async fn check_stale_response_is_ignored() {
        let sink = RecordingSink::default();
        let channel = CorrelationChannel::new(sink);

        channel
            .handle_frame(Frame::Response {
                id: 42,
                res: Some(Value::Null),
                err: None,
            })
            .await;

        assert_eq!(0, channel.pending_count());
    }

    #[tokio::test]
    async fn check_inbound_request_gets_exactly_one_response() {
        let sink = RecordingSink::default();
        let channel = CorrelationChannel::new(sink.clone());

        channel.set_request_listener(Box::new(|_, data| {
            Box::pin(async move {
                if data.method == "getNetwork" {
                    Ok(json!("mainnet"))
                } else {
                    Err(Error::new(ErrorKind::ValidationError, "Unknown method"))
                }
            })
        }));

        channel
            .handle_frame(Frame::Request {
                id: 3,
                data: payload("getNetwork"),
            })
            .await;
        channel
            .handle_frame(Frame::Request {
                id: 4,
                data: payload("bogus"),
            })
            .await;

        let frames = sink.take();
        assert_eq!(2, frames.len());

        match &frames[0] {
            Frame::Response { id, res, err } => {
                assert_eq!(3, *id);
                assert_eq!(Some(json!("mainnet")), *res);
                assert!(err.is_none());
            }
            other => panic!("Expected response frame, got {:?}", other),
        }

        match &frames[1] {
            Frame::Response { id, res, err } => {
                assert_eq!(4, *id);
                assert!(res.is_none());
                let err = err.as_ref().expect("Error frame");
                assert_eq!(Some(ErrorKind::ValidationError.wire_code()), err.code);
            }
            other => panic!("Expected response frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn check_dispose_rejects_pending() {
        let sink = RecordingSink::default();
        let channel = Arc::new(CorrelationChannel::new(sink));

        let requester = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(payload("signPsbt")).await })
        };

        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        channel.dispose();

        let error = requester
            .await
            .unwrap()
            .expect_err("Disposal should reject pending requests");
        assert_eq!(ErrorKind::UserRejectedError, error.kind());

        // the channel refuses new requests afterwards
        let error = channel
            .request(payload("signPsbt"))
            .await
            .expect_err("Disposed channel should refuse requests");
        assert_eq!(ErrorKind::TransportError, error.kind());
    }

    #[tokio::test]
    async fn check_push_dispatch() {
        let sink = RecordingSink::default();
        let channel = CorrelationChannel::new(sink);

        let seen: Arc<Mutex<Vec<String>>> = Default::default();
        let seen_clone = seen.clone();
        channel.add_push_listener(Box::new(move |data| {
            seen_clone.lock().unwrap().push(data.event.clone());
        }));

        channel
            .handle_frame(Frame::Message {
                data: PushPayload {
                    event: "accountsChanged".to_string(),
                    payload: json!(["bc1qexample"]),
                },
            })
            .await;

        assert_eq!(vec!["accountsChanged".to_string()], *seen.lock().unwrap());
    }
}
