//! Call signaling state machine.
//!
//! One record per call attempt, transitioning `pending -> {accepted,
//! rejected, missed}` and `accepted -> ended` (plus `pending -> ended`
//! for a caller hang-up while ringing).  Transitions are compare-and-set
//! on the status column: of two racing operations only the first wins and
//! the loser is told "already processed".  Relay decisions always use the
//! live-connection probe, never the durable online flag, so a stale flag
//! can neither ring a dead socket nor drop a live one.

use chrono::Utc;
use tracing::{info, warn};

use classlink_shared::error::Result;
use classlink_shared::protocol::{ServerEvent, WireCall};
use classlink_shared::types::{CallId, CallStatus, UserId};
use classlink_shared::SignalError;

use classlink_store::{Call, StoreError};

use crate::api::SharedStore;
use crate::registry::SessionRegistry;
use crate::topic::Topics;

pub struct CallSignaling {
    store: SharedStore,
    topics: Topics,
    registry: SessionRegistry,
}

impl CallSignaling {
    pub fn new(store: SharedStore, topics: Topics, registry: SessionRegistry) -> Self {
        Self {
            store,
            topics,
            registry,
        }
    }

    /// Start a call attempt.
    ///
    /// If the receiver has no live connection the record is created
    /// directly in `missed` and nothing is relayed -- this prevents
    /// phantom ringing off a stale online flag.  Returns the id and the
    /// status the record was created in.
    pub async fn initiate(
        &self,
        caller: UserId,
        to: UserId,
        offer: String,
        caller_name: Option<String>,
    ) -> Result<(CallId, CallStatus)> {
        if caller == to {
            return Err(SignalError::Validation("Cannot call yourself".to_string()));
        }

        {
            let db = self.store.lock().await;
            db.get_user(to).map_err(user_err(to))?;
        }

        let reachable = self.registry.is_reachable(to).await;
        let status = if reachable {
            CallStatus::Pending
        } else {
            CallStatus::Missed
        };

        let now = Utc::now();
        let call = Call {
            id: CallId::new(),
            caller_id: caller,
            receiver_id: to,
            offer: offer.clone(),
            status,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: if reachable { None } else { Some(now) },
            duration_secs: 0,
        };

        self.store
            .lock()
            .await
            .insert_call(&call)
            .map_err(|e| SignalError::Dependency(e.to_string()))?;

        info!(
            call = %call.id,
            from = %caller,
            to = %to,
            status = status.as_str(),
            "call initiated"
        );

        if reachable {
            self.topics
                .publish(
                    &to.to_topic(),
                    &ServerEvent::IncomingCall {
                        call_id: call.id,
                        from: caller,
                        caller_name,
                        offer,
                    },
                )
                .await;
        }

        Ok((call.id, status))
    }

    /// Accept a ringing call and relay the answer payload to the caller.
    ///
    /// Re-validates that the caller is still reachable: a caller may have
    /// dropped between ring and answer, in which case the call is closed
    /// out as `missed` and the answerer gets an error instead of a
    /// one-sided session.
    pub async fn answer(&self, answerer: UserId, call_id: CallId, answer: String) -> Result<()> {
        let call = self.get_call(call_id).await?;
        if call.receiver_id != answerer {
            return Err(SignalError::Validation(
                "Only the callee may answer this call".to_string(),
            ));
        }

        if !self.registry.is_reachable(call.caller_id).await {
            let now = Utc::now();
            let closed = self
                .store
                .lock()
                .await
                .transition_call(call_id, CallStatus::Pending, CallStatus::Missed, None, Some(now), Some(0))
                .map_err(|e| SignalError::Dependency(e.to_string()))?;
            if closed {
                warn!(call = %call_id, "caller dropped before answer, call marked missed");
            }
            return Err(SignalError::StateConflict(
                "Caller is no longer reachable".to_string(),
            ));
        }

        let now = Utc::now();
        let won = self
            .store
            .lock()
            .await
            .transition_call(call_id, CallStatus::Pending, CallStatus::Accepted, Some(now), None, None)
            .map_err(|e| SignalError::Dependency(e.to_string()))?;
        if !won {
            return Err(SignalError::StateConflict(
                "Call already processed".to_string(),
            ));
        }

        info!(call = %call_id, by = %answerer, "call accepted");

        self.topics
            .publish(
                &call.caller_id.to_topic(),
                &ServerEvent::CallAccepted { call_id, answer },
            )
            .await;
        self.topics
            .publish(&answerer.to_topic(), &ServerEvent::CallAnswered { call_id })
            .await;

        Ok(())
    }

    /// Decline a ringing call.  A rejected call never started, so its
    /// duration is zero.
    pub async fn reject(&self, rejecter: UserId, call_id: CallId) -> Result<()> {
        let call = self.get_call(call_id).await?;
        if call.receiver_id != rejecter {
            return Err(SignalError::Validation(
                "Only the callee may reject this call".to_string(),
            ));
        }

        let now = Utc::now();
        let won = self
            .store
            .lock()
            .await
            .transition_call(call_id, CallStatus::Pending, CallStatus::Rejected, None, Some(now), Some(0))
            .map_err(|e| SignalError::Dependency(e.to_string()))?;
        if !won {
            return Err(SignalError::StateConflict(
                "Call already processed".to_string(),
            ));
        }

        info!(call = %call_id, by = %rejecter, "call rejected");

        self.topics
            .publish(&call.caller_id.to_topic(), &ServerEvent::CallRejected { call_id })
            .await;

        Ok(())
    }

    /// Hang up.  Valid from any non-terminal state and for either party;
    /// duration is accounted only when the call had been accepted.
    pub async fn end(&self, ender: UserId, call_id: CallId) -> Result<i64> {
        let call = self.get_call(call_id).await?;
        if call.caller_id != ender && call.receiver_id != ender {
            return Err(SignalError::Validation(
                "Only a participant may end this call".to_string(),
            ));
        }

        let now = Utc::now();
        let (expected, duration) = match call.status {
            CallStatus::Accepted => {
                let duration = call
                    .started_at
                    .map(|started| (now - started).num_seconds().max(0))
                    .unwrap_or(0);
                (CallStatus::Accepted, duration)
            }
            CallStatus::Pending => (CallStatus::Pending, 0),
            _ => {
                return Err(SignalError::StateConflict(
                    "Call already processed".to_string(),
                ));
            }
        };

        let won = self
            .store
            .lock()
            .await
            .transition_call(call_id, expected, CallStatus::Ended, None, Some(now), Some(duration))
            .map_err(|e| SignalError::Dependency(e.to_string()))?;
        if !won {
            return Err(SignalError::StateConflict(
                "Call already processed".to_string(),
            ));
        }

        info!(call = %call_id, by = %ender, duration, "call ended");

        let event = ServerEvent::CallEnded { call_id, duration_secs: duration };
        self.topics.publish(&call.caller_id.to_topic(), &event).await;
        self.topics.publish(&call.receiver_id.to_topic(), &event).await;

        Ok(duration)
    }

    /// Stateless ICE candidate pass-through.  Candidates are never
    /// persisted; an unreachable target is an error, not a silent drop.
    pub async fn relay_ice(
        &self,
        from: UserId,
        to: UserId,
        candidate: String,
        call_id: Option<CallId>,
    ) -> Result<()> {
        if !self.registry.is_reachable(to).await {
            return Err(SignalError::StateConflict("Receiver offline".to_string()));
        }

        self.topics
            .publish(
                &to.to_topic(),
                &ServerEvent::IceCandidate { call_id, from, candidate },
            )
            .await;
        Ok(())
    }

    /// Call history between the requester and a counterpart, newest first.
    pub async fn logs(&self, requester: UserId, counterpart: UserId) -> Result<Vec<WireCall>> {
        let calls = self
            .store
            .lock()
            .await
            .calls_between(requester, counterpart)
            .map_err(|e| SignalError::Dependency(e.to_string()))?;
        Ok(calls.iter().map(to_wire_call).collect())
    }

    async fn get_call(&self, call_id: CallId) -> Result<Call> {
        self.store
            .lock()
            .await
            .get_call(call_id)
            .map_err(|e| match e {
                StoreError::NotFound => SignalError::NotFound(format!("call {call_id}")),
                other => SignalError::Dependency(other.to_string()),
            })
    }
}

fn user_err(id: UserId) -> impl FnOnce(StoreError) -> SignalError {
    move |e| match e {
        StoreError::NotFound => SignalError::NotFound(format!("user {id}")),
        other => SignalError::Dependency(other.to_string()),
    }
}

/// Wire view of a persisted call.
pub fn to_wire_call(call: &Call) -> WireCall {
    WireCall {
        id: call.id,
        caller_id: call.caller_id,
        receiver_id: call.receiver_id,
        status: call.status,
        created_at: call.created_at,
        started_at: call.started_at,
        ended_at: call.ended_at,
        duration_secs: call.duration_secs,
    }
}
