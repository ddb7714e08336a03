use crate::{
    types::{MessageId, Method, NodeId},
    wire::Event,
};
use futures::future::join_all;
use std::{panic, time::Duration};
use tokio::task::JoinHandle;

/// Terminal outcome of a single delivery unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered (and, for PubSub, acknowledged) after `attempts` attempts.
    Delivered { attempts: u32, latency: Duration },
    /// Lost after `attempts` attempts.
    Lost { attempts: u32 },
    /// Stopped by shutdown before reaching a terminal state (nothing was recorded).
    Cancelled,
}

/// Outcome for a single recipient of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientOutcome {
    pub recipient: NodeId,
    pub outcome: Outcome,
}

/// Completion handle for a submitted message.
///
/// Dropping the handle does not stop delivery.
pub struct DeliveryHandle {
    message: MessageId,
    method: Method,
    tasks: Vec<(NodeId, JoinHandle<Outcome>)>,
}

impl DeliveryHandle {
    pub(super) fn new(
        message: MessageId,
        method: Method,
        tasks: Vec<(NodeId, JoinHandle<Outcome>)>,
    ) -> Self {
        Self {
            message,
            method,
            tasks,
        }
    }

    pub fn message(&self) -> MessageId {
        self.message
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Recipients the message is being delivered to.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|(recipient, _)| recipient.as_str())
    }

    /// Event returned to the submitter once the message is accepted.
    pub fn sent_ack(&self) -> Event {
        Event::SentAck {
            msg_id: self.message,
            method: self.method,
        }
    }

    /// Wait for every recipient to reach a terminal outcome.
    ///
    /// # Panics
    ///
    /// Resumes the panic of any delivery task that panicked. Aborted tasks resolve to
    /// [Outcome::Cancelled].
    pub async fn wait(self) -> Vec<RecipientOutcome> {
        let (recipients, tasks): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        join_all(tasks)
            .await
            .into_iter()
            .zip(recipients)
            .map(|(result, recipient)| {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                    Err(_) => Outcome::Cancelled,
                };
                RecipientOutcome { recipient, outcome }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(tasks: Vec<(NodeId, JoinHandle<Outcome>)>) -> DeliveryHandle {
        DeliveryHandle::new(MessageId::random(), Method::PubSub, tasks)
    }

    #[tokio::test]
    async fn test_aborted_task_is_cancelled() {
        let task = tokio::spawn(std::future::pending::<Outcome>());
        task.abort();
        let delivered = tokio::spawn(async { Outcome::Lost { attempts: 3 } });
        let outcomes = handle(vec![("A".into(), task), ("B".into(), delivered)])
            .wait()
            .await;
        assert_eq!(outcomes[0].outcome, Outcome::Cancelled);
        assert_eq!(outcomes[1].outcome, Outcome::Lost { attempts: 3 });
    }

    async fn broken() -> Outcome {
        panic!("delivery bug")
    }

    #[tokio::test]
    #[should_panic(expected = "delivery bug")]
    async fn test_panicked_task_resumed() {
        let task = tokio::spawn(broken());
        handle(vec![("A".into(), task)]).wait().await;
    }
}
