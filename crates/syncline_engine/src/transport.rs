//! Transport layer abstraction for sync batches.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use syncline_protocol::{BatchReply, OutgoingMessage, ResponseMessage};

/// A channel to the remote authority.
///
/// One call is one network round trip carrying the whole batch. The reply
/// holds the responses plus a flag telling whether the authority processed
/// the batch completely.
pub trait RemoteChannel: Send + Sync {
    /// Sends a batch and waits for the reply.
    fn send(&self, batch: &[OutgoingMessage]) -> SyncResult<BatchReply>;
}

/// One scripted behaviour of a [`MockChannel`].
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Return this reply.
    Reply(BatchReply),
    /// Fail with a retryable transport error.
    TransportError(String),
    /// Sleep before answering automatically.
    Stall(Duration),
    /// Panic inside `send`.
    Panic(String),
}

/// A mock channel for testing.
///
/// Scripted steps are consumed first; once the script is empty the mock
/// answers automatically, acknowledging every change and echoing each
/// `BriefMe` watermark back, with `complete = true`.
#[derive(Debug, Default)]
pub struct MockChannel {
    script: Mutex<VecDeque<MockStep>>,
    sent: Mutex<Vec<Vec<OutgoingMessage>>>,
}

impl MockChannel {
    /// Creates a new mock channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step to the script.
    pub fn push_step(&self, step: MockStep) {
        self.script.lock().push_back(step);
    }

    /// Scripts the next reply.
    pub fn reply_next(&self, reply: BatchReply) {
        self.push_step(MockStep::Reply(reply));
    }

    /// Scripts the next call to fail.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.push_step(MockStep::TransportError(message.into()));
    }

    /// Returns every batch sent so far.
    pub fn sent_batches(&self) -> Vec<Vec<OutgoingMessage>> {
        self.sent.lock().clone()
    }

    /// Returns the batches that carried at least one change message.
    pub fn change_batches(&self) -> Vec<Vec<OutgoingMessage>> {
        self.sent
            .lock()
            .iter()
            .filter(|batch| batch.iter().any(OutgoingMessage::is_change))
            .cloned()
            .collect()
    }

    /// Returns the number of calls so far.
    pub fn call_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Builds the automatic reply for a batch.
    pub fn auto_reply(batch: &[OutgoingMessage]) -> BatchReply {
        let responses = batch
            .iter()
            .map(|message| match message {
                OutgoingMessage::ChangesHappened {
                    entity_type,
                    entity_id,
                    outstanding,
                } => ResponseMessage::Acknowledged {
                    entity_type: *entity_type,
                    entity_id: *entity_id,
                    through: outstanding.through(),
                },
                OutgoingMessage::BriefMe {
                    entity_type,
                    last_synced,
                } => ResponseMessage::Watermark {
                    entity_type: *entity_type,
                    timestamp: *last_synced,
                },
            })
            .collect();
        BatchReply::complete(responses)
    }
}

impl RemoteChannel for MockChannel {
    fn send(&self, batch: &[OutgoingMessage]) -> SyncResult<BatchReply> {
        self.sent.lock().push(batch.to_vec());

        let step = self.script.lock().pop_front();
        match step {
            Some(MockStep::Reply(reply)) => Ok(reply),
            Some(MockStep::TransportError(message)) => Err(SyncError::transport_retryable(message)),
            Some(MockStep::Stall(delay)) => {
                std::thread::sleep(delay);
                Ok(Self::auto_reply(batch))
            }
            Some(MockStep::Panic(message)) => panic!("{message}"),
            None => Ok(Self::auto_reply(batch)),
        }
    }
}
