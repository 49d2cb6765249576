//! Stats events published on `stats_channel_{id}`.
//!
//! Payloads are bare event names. A subscription either follows one session's channel or
//! pattern-subscribes to every session; the session id is recovered from the channel name.

use futures_util::stream::{Stream, StreamExt};
use redis::Msg;
use std::fmt;
use std::pin::Pin;
use tokio::sync::watch;

use crate::error::SessionError;
use crate::keys;
use crate::store::StoreHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatsEventKind {
    StatusChange,
    CompleteTasks,
    FailedTasks,
    RejectedTasks,
    CrawledContent,
    EvaluatedContent,
    /// Payload not produced by this crate; kept so observers can log it.
    Other(String),
}

impl StatsEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            StatsEventKind::StatusChange => "status_change",
            StatsEventKind::CompleteTasks => "complete_tasks",
            StatsEventKind::FailedTasks => "failed_tasks",
            StatsEventKind::RejectedTasks => "rejected_tasks",
            StatsEventKind::CrawledContent => "crawled_content",
            StatsEventKind::EvaluatedContent => "evaluated_content",
            StatsEventKind::Other(raw) => raw,
        }
    }

    pub fn parse(payload: &str) -> Self {
        match payload {
            "status_change" => StatsEventKind::StatusChange,
            "complete_tasks" => StatsEventKind::CompleteTasks,
            "failed_tasks" => StatsEventKind::FailedTasks,
            "rejected_tasks" => StatsEventKind::RejectedTasks,
            "crawled_content" => StatsEventKind::CrawledContent,
            "evaluated_content" => StatsEventKind::EvaluatedContent,
            other => StatsEventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StatsEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsEvent {
    pub session_id: String,
    pub kind: StatsEventKind,
}

impl StatsEvent {
    pub fn from_parts(channel: &str, payload: &str) -> Option<Self> {
        let session_id = keys::session_id_from_channel(channel)?;
        Some(Self {
            session_id: session_id.to_string(),
            kind: StatsEventKind::parse(payload),
        })
    }

    fn from_message(msg: &Msg) -> Option<Self> {
        let payload: String = msg.get_payload().ok()?;
        Self::from_parts(msg.get_channel_name(), &payload)
    }
}

/// Which channels to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeTarget {
    Session(String),
    All,
}

/// Owns a dedicated pub/sub connection. Stopping the manager that opened it releases the
/// connection and ends the stream.
pub struct StatsSubscription {
    target: SubscribeTarget,
    messages: Option<Pin<Box<dyn Stream<Item = Msg> + Send>>>,
    closed: watch::Receiver<bool>,
}

impl StatsSubscription {
    pub(crate) async fn open(
        store: &StoreHandle,
        target: SubscribeTarget,
    ) -> Result<Self, SessionError> {
        let closed = store.closed_signal();
        let mut pubsub = store.pubsub().await?;
        match &target {
            SubscribeTarget::Session(id) => pubsub.subscribe(keys::stats_channel(id)).await?,
            SubscribeTarget::All => pubsub.psubscribe(keys::stats_channel_mask()).await?,
        }
        tracing::debug!(?target, "Subscribed to stats channel");

        Ok(Self {
            target,
            messages: Some(Box::pin(pubsub.into_on_message())),
            closed,
        })
    }

    pub fn target(&self) -> &SubscribeTarget {
        &self.target
    }

    /// Next well-formed event. `None` once the connection is gone or the manager stopped.
    pub async fn next_event(&mut self) -> Option<StatsEvent> {
        loop {
            if *self.closed.borrow() {
                self.messages = None;
                return None;
            }
            let messages = self.messages.as_mut()?;

            let msg = tokio::select! {
                msg = messages.next() => msg?,
                // Disabled once every store handle is gone: nothing can close us then.
                _ = self.closed.changed(), if self.closed.has_changed().is_ok() => continue,
            };
            match StatsEvent::from_message(&msg) {
                Some(event) => return Some(event),
                None => {
                    tracing::warn!(channel = msg.get_channel_name(), "Ignoring malformed stats message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let kinds = [
            StatsEventKind::StatusChange,
            StatsEventKind::CompleteTasks,
            StatsEventKind::FailedTasks,
            StatsEventKind::RejectedTasks,
            StatsEventKind::CrawledContent,
            StatsEventKind::EvaluatedContent,
        ];
        for kind in kinds {
            assert_eq!(StatsEventKind::parse(kind.as_str()), kind);
        }
        assert_eq!(StatsEventKind::CompleteTasks.as_str(), "complete_tasks");
    }

    #[test]
    fn test_unknown_payload_is_kept() {
        assert_eq!(
            StatsEventKind::parse("reindex"),
            StatsEventKind::Other("reindex".to_string())
        );
    }

    #[test]
    fn test_event_from_channel() {
        let event = StatsEvent::from_parts("stats_channel_abc", "status_change").unwrap();
        assert_eq!(event.session_id, "abc");
        assert_eq!(event.kind, StatsEventKind::StatusChange);
        assert!(StatsEvent::from_parts("stats_channel_", "status_change").is_none());
    }
}
