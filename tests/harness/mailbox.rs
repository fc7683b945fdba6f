use anyhow::Result;
use async_trait::async_trait;
use futures::channel::oneshot;
use njord::{
    mailbox::{Mailbox, StreamId},
    sidecar::Ticket,
    traits::KeyDescriptor,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

/// An in-memory cipher-box relay. `pair` returns the two endpoints of the
/// same relay; a message sent on a stream by one endpoint is delivered to
/// the other, mirroring the bidirectional two-party pipe of the real
/// transport. Tests can arm one-shot message drops per stream.
#[derive(Clone)]
pub struct TestMailbox {
    shared: Arc<Mutex<MailState>>,
    endpoint: usize,
}

#[derive(Default)]
struct MailState {
    queues: HashMap<(StreamId, usize), VecDeque<Vec<u8>>>,
    waiters: HashMap<(StreamId, usize), Vec<oneshot::Sender<Vec<u8>>>>,
    drops: HashMap<StreamId, u32>,
    sent: HashMap<StreamId, u32>,
}

impl TestMailbox {
    pub fn pair() -> (TestMailbox, TestMailbox) {
        let shared = Arc::new(Mutex::new(MailState::default()));

        (
            TestMailbox {
                shared: shared.clone(),
                endpoint: 0,
            },
            TestMailbox {
                shared,
                endpoint: 1,
            },
        )
    }

    /// Discard the next message sent on `stream`, from either endpoint.
    pub fn drop_next(&self, stream: StreamId) {
        *self
            .shared
            .lock()
            .unwrap()
            .drops
            .entry(stream)
            .or_insert(0) += 1;
    }

    /// Number of messages ever sent on `stream`, including dropped ones.
    pub fn sent(&self, stream: StreamId) -> u32 {
        self.shared
            .lock()
            .unwrap()
            .sent
            .get(&stream)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Mailbox for TestMailbox {
    async fn init_ticket_box(&self, _stream: StreamId, _ticket: &Ticket) -> Result<()> {
        Ok(())
    }

    async fn init_account_box(
        &self,
        _stream: StreamId,
        _account_key: &KeyDescriptor,
    ) -> Result<()> {
        Ok(())
    }

    async fn send(&self, stream: StreamId, message: Vec<u8>) -> Result<()> {
        let mut state = self.shared.lock().unwrap();

        *state.sent.entry(stream).or_insert(0) += 1;

        if let Some(drops) = state.drops.get_mut(&stream) {
            if *drops > 0 {
                *drops -= 1;
                return Ok(());
            }
        }

        let dest = (stream, 1 - self.endpoint);

        let mut message = message;
        if let Some(waiters) = state.waiters.get_mut(&dest) {
            while let Some(waiter) = waiters.pop() {
                match waiter.send(message) {
                    Ok(()) => return Ok(()),
                    // The receiver gave up; try the next one.
                    Err(returned) => message = returned,
                }
            }
        }

        state.queues.entry(dest).or_default().push_back(message);

        Ok(())
    }

    async fn recv(&self, stream: StreamId) -> Result<Vec<u8>> {
        loop {
            let receiver = {
                let mut state = self.shared.lock().unwrap();
                let key = (stream, self.endpoint);

                if let Some(message) =
                    state.queues.get_mut(&key).and_then(|queue| queue.pop_front())
                {
                    return Ok(message);
                }

                let (sender, receiver) = oneshot::channel();
                state.waiters.entry(key).or_default().push(sender);

                receiver
            };

            if let Ok(message) = receiver.await {
                return Ok(message);
            }
        }
    }

    async fn delete_ticket_box(&self, stream: StreamId, _ticket: &Ticket) -> Result<()> {
        let mut state = self.shared.lock().unwrap();
        state.queues.remove(&(stream, 0));
        state.queues.remove(&(stream, 1));

        Ok(())
    }

    async fn delete_account_box(
        &self,
        stream: StreamId,
        _account_key: &KeyDescriptor,
    ) -> Result<()> {
        let mut state = self.shared.lock().unwrap();
        state.queues.remove(&(stream, 0));
        state.queues.remove(&(stream, 1));

        Ok(())
    }
}
