use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keygate_contracts::{
    ActionToken, Button, ChatId, Command, DecisionAction, InboundEvent, Keyboard, Requester,
    RequesterId, ResourceId,
};
use keygate_kernel::{
    messages, LedgerError, PendingRequest, PoolError, RequestLedger, ResourcePool,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditJsonl, AuditRecord};
use crate::gateway::{ChatGateway, GatewayError, ReplyTarget};

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub admin: ChatId,
    pub probe_timeout: Duration,
    pub delivery_timeout: Duration,
    pub bot_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Forwarded {
        resource_id: ResourceId,
        open_requests: usize,
    },
    AlreadyPending,
    ChannelUnreachable,
    PoolExhausted,
    /// The prompt could not reach the administrator; the reservation was released.
    AdminUnreachable,
    StorageFailure,
}

impl RequestOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            RequestOutcome::Forwarded { .. } => "forwarded",
            RequestOutcome::AlreadyPending => "already_pending",
            RequestOutcome::ChannelUnreachable => "channel_unreachable",
            RequestOutcome::PoolExhausted => "pool_exhausted",
            RequestOutcome::AdminUnreachable => "admin_unreachable",
            RequestOutcome::StorageFailure => "storage_failure",
        }
    }

    fn resource(&self) -> Option<&ResourceId> {
        match self {
            RequestOutcome::Forwarded { resource_id, .. } => Some(resource_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    NotFound,
    RequesterUnreachable {
        resource_id: ResourceId,
    },
    Issued {
        resource_id: ResourceId,
    },
    DeliveryFailed {
        resource_id: ResourceId,
        reason: String,
    },
    Rejected {
        resource_id: ResourceId,
        notified: bool,
    },
    /// Delivered, but the resource had already left the available partition.
    CommitConflict {
        resource_id: ResourceId,
    },
    /// Delivered, but the partition move failed. The resource is withheld from
    /// allocation and the move is retried on later reservations.
    CommitFailed {
        resource_id: ResourceId,
        reason: String,
    },
}

impl DecisionOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            DecisionOutcome::NotFound => "not_found",
            DecisionOutcome::RequesterUnreachable { .. } => "requester_unreachable",
            DecisionOutcome::Issued { .. } => "issued",
            DecisionOutcome::DeliveryFailed { .. } => "delivery_failed",
            DecisionOutcome::Rejected { .. } => "rejected",
            DecisionOutcome::CommitConflict { .. } => "commit_conflict",
            DecisionOutcome::CommitFailed { .. } => "commit_failed",
        }
    }

    fn resource(&self) -> Option<&ResourceId> {
        match self {
            DecisionOutcome::NotFound => None,
            DecisionOutcome::RequesterUnreachable { resource_id }
            | DecisionOutcome::Issued { resource_id }
            | DecisionOutcome::DeliveryFailed { resource_id, .. }
            | DecisionOutcome::Rejected { resource_id, .. }
            | DecisionOutcome::CommitConflict { resource_id }
            | DecisionOutcome::CommitFailed { resource_id, .. } => Some(resource_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub reserved: usize,
    pub issued: usize,
    pub pending: usize,
}

struct CoreState {
    pool: ResourcePool,
    ledger: RequestLedger,
    /// Delivered resources whose commit failed; never offered again.
    stranded: BTreeSet<ResourceId>,
}

enum Reservation {
    Opened(PendingRequest, usize),
    AlreadyPending,
    Exhausted,
    Storage(PoolError),
}

impl CoreState {
    fn held(&self) -> BTreeSet<ResourceId> {
        let mut held = self.ledger.reserved();
        held.extend(self.stranded.iter().cloned());
        held
    }

    fn retry_stranded(&mut self) {
        let pool = &self.pool;
        self.stranded.retain(|id| match pool.commit(id) {
            Ok(()) => {
                info!(resource_id = %id, "stranded resource committed");
                false
            }
            Err(PoolError::NotFound(_)) => false,
            Err(e) => {
                debug!(resource_id = %id, error = %e, "stranded resource still uncommitted");
                true
            }
        });
    }

    fn reserve(&mut self, requester: &Requester) -> Reservation {
        self.retry_stranded();
        let held = self.held();
        let resource_id = match self.pool.reserve_next(&held) {
            Ok(Some(id)) => id,
            Ok(None) => return Reservation::Exhausted,
            Err(e) => return Reservation::Storage(e),
        };
        let opened = self
            .ledger
            .try_open(requester.clone(), resource_id, Utc::now())
            .map(PendingRequest::clone);
        match opened {
            Ok(pending) => Reservation::Opened(pending, self.ledger.len()),
            Err(LedgerError::AlreadyPending(_)) => Reservation::AlreadyPending,
        }
    }
}

/// Allocation engine and decision processor behind one lock.
///
/// Pool and ledger are only touched while `state` is held; gateway calls run
/// outside the lock and are bounded by the configured timeouts.
pub struct AllocationService {
    settings: GateSettings,
    state: Mutex<CoreState>,
    gateway: Arc<dyn ChatGateway>,
    audit: Option<Arc<AuditJsonl>>,
}

impl AllocationService {
    pub fn new(pool: ResourcePool, gateway: Arc<dyn ChatGateway>, settings: GateSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(CoreState {
                pool,
                ledger: RequestLedger::new(),
                stranded: BTreeSet::new(),
            }),
            gateway,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditJsonl>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn admin(&self) -> ChatId {
        self.settings.admin
    }

    pub fn bot_handle(&self) -> Option<&str> {
        self.settings.bot_handle.as_deref()
    }

    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let state = self.state.lock().await;
        let counts = state.pool.counts()?;
        Ok(PoolStatus {
            available: counts.available,
            reserved: state.held().len(),
            issued: counts.issued,
            pending: state.ledger.len(),
        })
    }

    pub async fn pending_for(&self, requester: RequesterId) -> Option<PendingRequest> {
        self.state.lock().await.ledger.peek(requester).cloned()
    }

    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Command {
                from,
                chat,
                command,
            } => match command {
                Command::Start => {
                    info!(requester_id = %from.id, "start");
                    let keyboard: Keyboard = vec![vec![Button::new(
                        messages::REQUEST_BUTTON,
                        ActionToken::RequestConfig,
                    )]];
                    let text =
                        messages::greeting(&from.display_name, self.settings.bot_handle.as_deref());
                    self.send(chat, &text, Some(&keyboard)).await;
                }
                Command::GetConfig => {
                    self.request_resource(&from, ReplyTarget::Chat(chat)).await;
                }
                Command::Other(name) => debug!(command = %name, "ignoring unknown command"),
            },
            InboundEvent::ButtonPress {
                from,
                callback_id,
                token,
                message,
            } => {
                if let Err(e) = bounded(
                    self.settings.delivery_timeout,
                    self.gateway.answer_button(&callback_id),
                )
                .await
                {
                    debug!(error = %e, "button acknowledgement failed");
                }
                let reply = message
                    .map(ReplyTarget::Edit)
                    .unwrap_or(ReplyTarget::Chat(from.id));
                match ActionToken::parse(&token) {
                    Some(ActionToken::RequestConfig) => {
                        self.request_resource(&from, reply).await;
                    }
                    Some(ActionToken::Decision { action, requester }) => {
                        if from.id != self.settings.admin {
                            warn!(from = %from.id, token = %token, "decision pressed by non-admin");
                            return;
                        }
                        self.apply_decision(action, requester, reply).await;
                    }
                    None => {
                        warn!(token = %token, "unrecognized button token");
                        self.respond(reply, messages::DECISION_FAILED).await;
                    }
                }
            }
            InboundEvent::Text { chat, .. } => self.send(chat, messages::TEXT_HINT, None).await,
        }
    }

    pub async fn request_resource(&self, requester: &Requester, reply: ReplyTarget) -> RequestOutcome {
        info!(requester_id = %requester.id, "config requested");
        let outcome = self.evaluate_request(requester, reply).await;
        info!(requester_id = %requester.id, outcome = outcome.code(), "request evaluated");
        self.record(requester.id, "request", outcome.code(), outcome.resource())
            .await;
        outcome
    }

    async fn evaluate_request(&self, requester: &Requester, reply: ReplyTarget) -> RequestOutcome {
        if self.state.lock().await.ledger.peek(requester.id).is_some() {
            self.respond(reply, messages::ALREADY_PENDING).await;
            return RequestOutcome::AlreadyPending;
        }

        if let Err(e) = self.probe(requester.id).await {
            warn!(requester_id = %requester.id, error = %e, "requester chat unreachable");
            let text = messages::open_private_chat(self.settings.bot_handle.as_deref());
            self.respond(reply, &text).await;
            return RequestOutcome::ChannelUnreachable;
        }

        let reservation = self.state.lock().await.reserve(requester);
        let (pending, open_requests) = match reservation {
            Reservation::Opened(pending, open_requests) => (pending, open_requests),
            Reservation::AlreadyPending => {
                self.respond(reply, messages::ALREADY_PENDING).await;
                return RequestOutcome::AlreadyPending;
            }
            Reservation::Exhausted => {
                warn!(requester_id = %requester.id, "pool exhausted");
                self.respond(reply, messages::POOL_EXHAUSTED).await;
                self.send(self.settings.admin, messages::POOL_EXHAUSTED_ALERT, None)
                    .await;
                return RequestOutcome::PoolExhausted;
            }
            Reservation::Storage(e) => {
                error!(requester_id = %requester.id, error = %e, "pool unavailable");
                self.respond(reply, messages::PROCESSING_FAILED).await;
                return RequestOutcome::StorageFailure;
            }
        };

        let keyboard: Keyboard = vec![vec![
            Button::new(
                messages::APPROVE_BUTTON,
                ActionToken::decision(DecisionAction::Approve, requester.id),
            ),
            Button::new(
                messages::REJECT_BUTTON,
                ActionToken::decision(DecisionAction::Reject, requester.id),
            ),
        ]];
        let prompt = messages::admin_prompt(&pending, open_requests);
        let sent = bounded(
            self.settings.delivery_timeout,
            self.gateway
                .send_text(self.settings.admin, &prompt, Some(&keyboard)),
        )
        .await;
        if let Err(e) = sent {
            error!(requester_id = %requester.id, error = %e, "admin prompt failed");
            self.state.lock().await.ledger.close(requester.id);
            self.respond(reply, messages::PROCESSING_FAILED).await;
            return RequestOutcome::AdminUnreachable;
        }

        self.respond(reply, messages::REQUEST_FORWARDED).await;
        RequestOutcome::Forwarded {
            resource_id: pending.resource_id,
            open_requests,
        }
    }

    pub async fn apply_decision(
        &self,
        action: DecisionAction,
        requester: RequesterId,
        reply: ReplyTarget,
    ) -> DecisionOutcome {
        let outcome = self.evaluate_decision(action, requester, reply).await;
        info!(
            requester_id = %requester,
            action = action.as_str(),
            outcome = outcome.code(),
            "decision applied"
        );
        self.record(requester, "decision", outcome.code(), outcome.resource())
            .await;
        outcome
    }

    async fn evaluate_decision(
        &self,
        action: DecisionAction,
        requester: RequesterId,
        reply: ReplyTarget,
    ) -> DecisionOutcome {
        let claimed = self.state.lock().await.ledger.claim(requester);
        let Some(pending) = claimed else {
            info!(requester_id = %requester, "decision for unknown or handled request");
            self.respond(reply, messages::NOT_FOUND).await;
            return DecisionOutcome::NotFound;
        };

        if let Err(e) = self.probe(requester).await {
            warn!(requester_id = %requester, error = %e, "requester chat unreachable at decision");
            self.state.lock().await.ledger.close(requester);
            self.respond(reply, &messages::requester_unreachable(requester))
                .await;
            return DecisionOutcome::RequesterUnreachable {
                resource_id: pending.resource_id,
            };
        }

        match action {
            DecisionAction::Approve => self.issue(pending, reply).await,
            DecisionAction::Reject => self.reject(pending, reply).await,
        }
    }

    async fn issue(&self, pending: PendingRequest, reply: ReplyTarget) -> DecisionOutcome {
        let requester = pending.requester.id;
        let resource_id = pending.resource_id;

        let read = self.state.lock().await.pool.read(&resource_id);
        let delivered = match read {
            Ok(resource) => {
                let caption = messages::delivery_caption(&resource.id);
                bounded(
                    self.settings.delivery_timeout,
                    self.gateway.send_document(
                        requester,
                        resource.id.as_str(),
                        resource.content,
                        &caption,
                    ),
                )
                .await
                .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = delivered {
            error!(requester_id = %requester, resource_id = %resource_id, error = %reason, "delivery failed");
            self.state.lock().await.ledger.close(requester);
            self.respond(reply, &messages::delivery_failed(&reason)).await;
            return DecisionOutcome::DeliveryFailed {
                resource_id,
                reason,
            };
        }

        let committed = {
            let mut state = self.state.lock().await;
            let committed = state.pool.commit(&resource_id);
            if matches!(committed, Err(PoolError::Storage(_))) {
                state.stranded.insert(resource_id.clone());
            }
            state.ledger.close(requester);
            committed
        };
        match committed {
            Ok(()) => {
                info!(requester_id = %requester, resource_id = %resource_id, "config issued");
                self.respond(reply, &messages::issued(requester, &resource_id))
                    .await;
                DecisionOutcome::Issued { resource_id }
            }
            Err(PoolError::Storage(reason)) => {
                error!(requester_id = %requester, resource_id = %resource_id, error = %reason, "commit failed after delivery");
                self.respond(
                    reply,
                    &messages::commit_failed(requester, &resource_id, &reason),
                )
                .await;
                DecisionOutcome::CommitFailed {
                    resource_id,
                    reason,
                }
            }
            Err(e) => {
                error!(requester_id = %requester, resource_id = %resource_id, error = %e, "invariant violated: delivered resource was not available");
                self.respond(reply, &messages::commit_conflict(requester, &resource_id))
                    .await;
                DecisionOutcome::CommitConflict { resource_id }
            }
        }
    }

    async fn reject(&self, pending: PendingRequest, reply: ReplyTarget) -> DecisionOutcome {
        let requester = pending.requester.id;
        let notified = match bounded(
            self.settings.delivery_timeout,
            self.gateway
                .send_text(requester, messages::REJECTED_NOTICE, None),
        )
        .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(requester_id = %requester, error = %e, "rejection notice failed");
                false
            }
        };
        self.state.lock().await.ledger.close(requester);
        self.respond(reply, &messages::rejected(requester)).await;
        DecisionOutcome::Rejected {
            resource_id: pending.resource_id,
            notified,
        }
    }

    async fn probe(&self, chat: ChatId) -> Result<(), GatewayError> {
        bounded(self.settings.probe_timeout, self.gateway.probe_channel(chat)).await
    }

    async fn respond(&self, reply: ReplyTarget, text: &str) {
        match reply {
            ReplyTarget::Chat(chat) => self.send(chat, text, None).await,
            ReplyTarget::Edit(message) => {
                if let Err(e) = bounded(
                    self.settings.delivery_timeout,
                    self.gateway.edit_message(&message, text),
                )
                .await
                {
                    warn!(chat = %message.chat, error = %e, "message edit failed");
                }
            }
        }
    }

    async fn send(&self, chat: ChatId, text: &str, keyboard: Option<&Keyboard>) {
        if let Err(e) = bounded(
            self.settings.delivery_timeout,
            self.gateway.send_text(chat, text, keyboard),
        )
        .await
        {
            warn!(chat = %chat, error = %e, "send failed");
        }
    }

    async fn record(
        &self,
        requester: RequesterId,
        action: &str,
        result: &str,
        resource: Option<&ResourceId>,
    ) {
        if let Some(audit) = &self.audit {
            audit
                .append(AuditRecord::new(requester, action, result, resource))
                .await;
        }
    }
}

async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}
