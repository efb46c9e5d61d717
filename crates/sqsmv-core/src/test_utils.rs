//! In-memory [`QueueService`] used by the transfer loop tests.
//!
//! Messages that are received but not deleted become visible again on the
//! next receive, as if their visibility timeout had already expired.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::queue::{
    BatchFailure, BatchOutcome, DeleteEntry, ForwardEntry, Message, MessageId, QueueAddress,
    QueueError, QueueService, ReceiptHandle, ReceiveOptions,
};

const SOURCE: &str = "source";
const DEST: &str = "dest";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Receive,
    Send(Vec<MessageId>),
    Delete(Vec<(MessageId, ReceiptHandle)>),
}

struct Stored {
    id: MessageId,
    body: String,
    deliveries: u32,
}

#[derive(Default)]
struct State {
    source: Vec<Stored>,
    destination: Vec<ForwardEntry>,
    calls: Vec<Call>,
    fail_send: HashSet<MessageId>,
    omit_send: HashSet<MessageId>,
    fail_delete_once: HashSet<MessageId>,
    receive_errors: VecDeque<QueueError>,
    send_errors: VecDeque<QueueError>,
    delete_errors: VecDeque<QueueError>,
    cancel_on_send: Option<CancellationToken>,
}

pub struct FakeQueues {
    state: Mutex<State>,
}

pub fn service_error(operation: &'static str, transient: bool) -> QueueError {
    QueueError::Service {
        operation,
        source: "injected failure".into(),
        transient,
    }
}

fn receipt(id: &MessageId, delivery: u32) -> ReceiptHandle {
    ReceiptHandle::new(format!("rh-{id}-{delivery}"))
}

impl FakeQueues {
    /// Source queue holding one message per body; each id equals its body.
    pub fn with_messages(bodies: &[&str]) -> Self {
        let source = bodies
            .iter()
            .map(|body| Stored {
                id: MessageId::new(*body),
                body: body.to_string(),
                deliveries: 0,
            })
            .collect();
        Self {
            state: Mutex::new(State {
                source,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub async fn addresses(&self) -> (QueueAddress, QueueAddress) {
        (
            self.resolve(SOURCE).await.unwrap(),
            self.resolve(DEST).await.unwrap(),
        )
    }

    pub fn fail_send(&self, id: &str) {
        self.state().fail_send.insert(MessageId::new(id));
    }

    pub fn omit_from_send_response(&self, id: &str) {
        self.state().omit_send.insert(MessageId::new(id));
    }

    pub fn fail_delete_once(&self, id: &str) {
        self.state().fail_delete_once.insert(MessageId::new(id));
    }

    pub fn fail_next_receive(&self, err: QueueError) {
        self.state().receive_errors.push_back(err);
    }

    pub fn fail_next_send(&self, err: QueueError) {
        self.state().send_errors.push_back(err);
    }

    pub fn fail_next_delete(&self, err: QueueError) {
        self.state().delete_errors.push_back(err);
    }

    /// Cancels `token` while the next send is in flight.
    pub fn cancel_during_send(&self, token: CancellationToken) {
        self.state().cancel_on_send = Some(token);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.state()
            .source
            .iter()
            .map(|m| m.id.to_string())
            .collect()
    }

    pub fn destination_bodies(&self) -> Vec<String> {
        self.state()
            .destination
            .iter()
            .map(|e| e.body.clone())
            .collect()
    }

    /// Receipt handed out for the `delivery`-th receive of `id`.
    pub fn receipt_of(&self, delivery: u32, id: &str) -> ReceiptHandle {
        receipt(&MessageId::new(id), delivery)
    }
}

fn failure(id: &MessageId, code: &str) -> BatchFailure {
    BatchFailure {
        id: id.clone(),
        code: code.to_string(),
        message: None,
        sender_fault: false,
    }
}

#[async_trait]
impl QueueService for FakeQueues {
    async fn resolve(&self, queue_name: &str) -> Result<QueueAddress, QueueError> {
        match queue_name {
            SOURCE | DEST => Ok(QueueAddress::new(format!("fake://{queue_name}"))),
            _ => Err(QueueError::NotFound {
                queue: queue_name.to_string(),
            }),
        }
    }

    async fn receive(
        &self,
        address: &QueueAddress,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        assert_eq!(address.as_str(), "fake://source");
        let mut state = self.state();
        state.calls.push(Call::Receive);
        if let Some(err) = state.receive_errors.pop_front() {
            return Err(err);
        }

        let messages = state
            .source
            .iter_mut()
            .take(options.max_messages as usize)
            .map(|stored| {
                stored.deliveries += 1;
                Message {
                    id: stored.id.clone(),
                    receipt: receipt(&stored.id, stored.deliveries),
                    body: stored.body.clone(),
                }
            })
            .collect();
        Ok(messages)
    }

    async fn send_batch(
        &self,
        address: &QueueAddress,
        entries: Vec<ForwardEntry>,
    ) -> Result<BatchOutcome, QueueError> {
        assert_eq!(address.as_str(), "fake://dest");
        let mut state = self.state();
        state
            .calls
            .push(Call::Send(entries.iter().map(|e| e.id.clone()).collect()));
        if let Some(token) = state.cancel_on_send.take() {
            token.cancel();
        }
        if let Some(err) = state.send_errors.pop_front() {
            return Err(err);
        }

        let mut outcome = BatchOutcome::default();
        for entry in entries {
            if state.fail_send.contains(&entry.id) {
                outcome.failed.push(failure(&entry.id, "InternalError"));
                continue;
            }
            let omitted = state.omit_send.contains(&entry.id);
            state.destination.push(entry.clone());
            if !omitted {
                outcome.successful.push(entry.id);
            }
        }
        Ok(outcome)
    }

    async fn delete_batch(
        &self,
        address: &QueueAddress,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchOutcome, QueueError> {
        assert_eq!(address.as_str(), "fake://source");
        let mut state = self.state();
        state.calls.push(Call::Delete(
            entries
                .iter()
                .map(|e| (e.id.clone(), e.receipt.clone()))
                .collect(),
        ));
        if let Some(err) = state.delete_errors.pop_front() {
            return Err(err);
        }

        let mut outcome = BatchOutcome::default();
        for entry in entries {
            if state.fail_delete_once.remove(&entry.id) {
                outcome.failed.push(failure(&entry.id, "InternalError"));
                continue;
            }
            let position = state
                .source
                .iter()
                .position(|m| m.id == entry.id && receipt(&m.id, m.deliveries) == entry.receipt);
            match position {
                Some(index) => {
                    state.source.remove(index);
                    outcome.successful.push(entry.id);
                }
                None => outcome
                    .failed
                    .push(failure(&entry.id, "ReceiptHandleIsInvalid")),
            }
        }
        Ok(outcome)
    }
}
