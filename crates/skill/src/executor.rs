use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use moltlink_core::PeerRef;
use moltlink_session::{Envelope, EnvelopeKind, SessionEngine};

use crate::error::Result;
use crate::registry::SkillRegistry;
use crate::task::{TaskReply, TaskRequest};

/// Performs delegated work on the receiving side
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, request: &TaskRequest, from: &PeerRef) -> TaskReply;
}

/// Answers inbound traffic on the local inbox: capability queries through
/// the registry, task requests through the handler.
pub struct Responder {
    engine: Arc<SessionEngine>,
    registry: Arc<SkillRegistry>,
    handler: Arc<dyn TaskHandler>,
}

impl Responder {
    pub fn new(
        engine: Arc<SessionEngine>,
        registry: Arc<SkillRegistry>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            engine,
            registry,
            handler,
        }
    }

    /// Handle whatever has arrived since the last poll. Returns how many
    /// envelopes were answered.
    ///
    /// The batch is already consumed once fetched, so a failed answer is
    /// logged and the rest of the batch is still served.
    pub async fn poll_once(&self) -> Result<usize> {
        let inbound = self.engine.fetch_inbound(self.engine.inbox()).await?;
        let mut handled = 0;

        for envelope in inbound {
            match self.handle(&envelope).await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to answer {} from {}: {}",
                    envelope.kind.label(),
                    envelope.sender,
                    e
                ),
            }
        }

        Ok(handled)
    }

    /// Answer one inbound envelope. `Ok(false)` when it needs no answer.
    async fn handle(&self, envelope: &Envelope) -> Result<bool> {
        match envelope.kind {
            EnvelopeKind::CapabilityQuery => {
                self.registry.answer_query(envelope).await?;
                Ok(true)
            }
            EnvelopeKind::Request => {
                let request: TaskRequest = match serde_json::from_value(envelope.payload.clone()) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!("Ignoring request from {} without a task: {}", envelope.sender, e);
                        return Ok(false);
                    }
                };

                info!(
                    "Executing '{}' for {} (delegation {})",
                    request.skill, envelope.sender, request.delegation_id
                );
                let start = Instant::now();
                let reply = self.handler.handle(&request, &envelope.sender).await;
                match &reply {
                    TaskReply::Success { .. } => info!(
                        "Delegation {} handled in {}ms",
                        request.delegation_id,
                        start.elapsed().as_millis()
                    ),
                    TaskReply::Failure { reason } => {
                        warn!("Delegation {} refused: {}", request.delegation_id, reason)
                    }
                }

                let payload = serde_json::to_value(&reply)?;
                self.engine
                    .reply(envelope, EnvelopeKind::Reply, 0, payload)
                    .await?;
                Ok(true)
            }
            _ => {
                debug!(
                    "Ignoring {} from {} on inbox",
                    envelope.kind.label(),
                    envelope.sender
                );
                Ok(false)
            }
        }
    }

    /// Poll at the session cadence until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.engine.config().poll_interval();
        info!("Responder for {} started", self.engine.local());

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                error!("Responder poll failed: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Responder for {} shutting down", self.engine.local());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Skill;
    use crate::taxonomy::Taxonomy;
    use moltlink_core::{ChannelRef, MemoryTransport, RegistryConfig, RetryConfig, SessionConfig};
    use moltlink_session::{decode, encode, SessionId};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, request: &TaskRequest, _from: &PeerRef) -> TaskReply {
            TaskReply::success(request.task.clone())
        }
    }

    fn responder(feed: &Arc<MemoryTransport>) -> Responder {
        let engine = Arc::new(SessionEngine::new(
            PeerRef::new("coder"),
            feed.clone(),
            SessionConfig::default(),
            RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                ..RetryConfig::default()
            },
        ));
        let registry = Arc::new(SkillRegistry::new(
            Arc::clone(&engine),
            Taxonomy::embedded().unwrap(),
            RegistryConfig::default(),
        ));
        registry.register_skill(Skill::standard("code_generation"));
        Responder::new(engine, registry, Arc::new(Echo))
    }

    fn inbound(feed: &MemoryTransport, kind: EnvelopeKind, payload: serde_json::Value) {
        inbound_from(feed, "boss", kind, payload);
    }

    fn inbound_from(feed: &MemoryTransport, from: &str, kind: EnvelopeKind, payload: serde_json::Value) {
        let boss = PeerRef::new(from);
        let envelope = Envelope::new(kind, boss.clone(), SessionId::new(), 0, payload);
        feed.inject(
            &ChannelRef::inbox(&PeerRef::new("coder")),
            &boss,
            &encode(&envelope).unwrap(),
        );
    }

    #[tokio::test]
    async fn test_answers_requests_and_queries() {
        let feed = Arc::new(MemoryTransport::new());
        let responder = responder(&feed);

        inbound(
            &feed,
            EnvelopeKind::Request,
            json!({"delegation_id": crate::task::DelegationId::new(), "skill": "code_generation", "task": "ship it"}),
        );
        inbound(&feed, EnvelopeKind::CapabilityQuery, json!({"type": "capability_query"}));
        inbound(&feed, EnvelopeKind::Request, json!("not a task"));
        inbound(&feed, EnvelopeKind::Broadcast, json!(null));

        assert_eq!(responder.poll_once().await.unwrap(), 2);
        assert_eq!(responder.poll_once().await.unwrap(), 0);

        let replies: Vec<Envelope> = feed
            .messages(&ChannelRef::inbox(&PeerRef::new("boss")))
            .iter()
            .map(|m| decode(&m.text).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind, EnvelopeKind::Reply);
        assert_eq!(replies[0].payload, json!({"status": "success", "result": "ship it"}));
        assert_eq!(replies[1].kind, EnvelopeKind::CapabilityAnswer);
        assert_eq!(replies[1].payload["skills"][0]["name"], "code_generation");
    }

    #[tokio::test]
    async fn test_failed_answer_does_not_lose_the_batch() {
        let feed = Arc::new(MemoryTransport::new());
        let responder = responder(&feed);
        let query = json!({"type": "capability_query"});
        inbound_from(&feed, "boss1", EnvelopeKind::CapabilityQuery, query.clone());
        inbound_from(&feed, "boss2", EnvelopeKind::CapabilityQuery, query);

        // exhausts the publish retries of the first answer only
        feed.fail_next_publishes(RetryConfig::default().max_attempts);
        assert_eq!(responder.poll_once().await.unwrap(), 1);

        assert!(feed.messages(&ChannelRef::inbox(&PeerRef::new("boss1"))).is_empty());
        let answers = feed.messages(&ChannelRef::inbox(&PeerRef::new("boss2")));
        assert_eq!(answers.len(), 1);
        assert_eq!(decode(&answers[0].text).unwrap().kind, EnvelopeKind::CapabilityAnswer);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let feed = Arc::new(MemoryTransport::new());
        let responder = Arc::new(responder(&feed));
        let (tx, rx) = watch::channel(false);

        let task = {
            let responder = Arc::clone(&responder);
            tokio::spawn(async move { responder.run(rx).await })
        };
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
