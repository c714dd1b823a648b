// src/services/publisher.rs
//! Publisher: anchors sealed identity states and confirms them.
//!
//! Three logical queues feed three worker loops. `to_publish` holds
//! identities with unpublished mutations (or a pending state left by a
//! retry); `to_confirm` holds identities with a `publishing` state;
//! `to_retry` holds identities whose last anchoring failed, each waiting out
//! its own exponential backoff. Each pass fans out over a bounded pool.
//! Anchor calls run outside the identity lock; status changes go through
//! short identity transactions.

use crate::blockchain::anchor::{AnchorError, AnchorStatus, AnchorTransition, StateAnchor};
use crate::config::PublisherSettings;
use crate::error::{IssuerError, Result};
use crate::models::did::Did;
use crate::models::state::{IdentityState, StateStatus};
use crate::services::events::{Event, EventBus};
use crate::services::identity_state::IdentityStateManager;
use crate::utils::crypto::{poseidon_hashes, Hash};
use crate::utils::retry::{retry_with_backoff, RetryPolicy};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Message the issuer key signs to attest a transition.
pub fn transition_message(previous: &Hash, new: &Hash) -> Hash {
    poseidon_hashes(&[*previous, *new])
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// Nothing is publishing.
    Idle,
    Pending,
    Confirmed(IdentityState),
    Failed(String),
}

/// Marks one identity as being published by this process.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Did>>,
    did: Did,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(&self.did);
    }
}

/// Automatic retries already spent on an identity's failed state.
struct Backoff {
    attempts: u32,
    next_at: Instant,
}

pub struct Publisher {
    states: Arc<IdentityStateManager>,
    anchor: Arc<dyn StateAnchor>,
    events: Arc<dyn EventBus>,
    settings: PublisherSettings,
    retry: RetryPolicy,
    publishing: Mutex<HashSet<Did>>,
    backoff: Mutex<HashMap<Did, Backoff>>,
}

impl Publisher {
    pub fn new(
        states: Arc<IdentityStateManager>,
        anchor: Arc<dyn StateAnchor>,
        events: Arc<dyn EventBus>,
        settings: PublisherSettings,
    ) -> Self {
        let retry = settings.retry_policy();
        Self {
            states,
            anchor,
            events,
            settings,
            retry,
            publishing: Mutex::new(HashSet::new()),
            backoff: Mutex::new(HashMap::new()),
        }
    }

    fn claim(&self, did: &Did) -> Result<InFlight<'_>> {
        let mut set = self.publishing.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(did.clone()) {
            return Err(IssuerError::PublicationInFlight);
        }
        Ok(InFlight { set: &self.publishing, did: did.clone() })
    }

    /// Seals the identity's open state (or picks up a pending one) and
    /// submits its transition, signed by the identity's authentication key.
    ///
    /// # Arguments
    /// * `did` - Identity to publish
    ///
    /// # Returns
    /// The state now `publishing`, carrying the anchor's transaction id
    ///
    /// # Errors
    /// * `PublicationInFlight` - another state is pending, publishing or failed
    /// * `NothingToPublish` - the open state has no claims or revocation mutation
    /// * `Quarantined` - the identity refuses mutations
    /// * `AnchorUnavailable` - submission failed after every retry; the state
    ///   is marked `failed`
    pub async fn publish_identity(&self, did: &Did) -> Result<IdentityState> {
        let _claim = self.claim(did)?;
        let identity = self.states.identity(did)?;
        if identity.quarantined {
            return Err(IssuerError::Quarantined(did.to_string()));
        }
        let states = self.states.states(did)?;
        if states.iter().any(|s| s.status == StateStatus::Publishing) {
            return Err(IssuerError::PublicationInFlight);
        }
        let sealed = match states.into_iter().find(|s| s.status == StateStatus::Pending) {
            Some(pending) => pending,
            None => self.states.seal_for_publication(did).await?,
        };
        let (previous_state, new_state) = match (sealed.previous_state, sealed.state) {
            (Some(previous), Some(new)) => (previous, new),
            _ => return Err(IssuerError::Internal(format!("pending state {} of {} is unsealed", sealed.seq, did))),
        };

        let proof = self
            .states
            .keys()
            .sign(&identity.key_id, &transition_message(&previous_state, &new_state).0)
            .await?;
        let transition = AnchorTransition {
            did: did.clone(),
            previous_state,
            new_state,
            is_old_state_genesis: sealed.seq == 1,
            proof,
        };

        let tx_id = match retry_with_backoff(&self.retry, "anchor submit", || self.anchor.submit(&transition)).await {
            Ok(tx_id) => tx_id,
            Err(e) => {
                self.states.mark_failed(did, sealed.seq, &e.to_string()).await?;
                return Err(e.into());
            }
        };
        self.states.mark_publishing(did, sealed.seq, &tx_id).await
    }

    /// Polls the anchor for the identity's publishing state and applies the
    /// outcome. A confirmation attaches inclusion proofs to the credentials
    /// it covers and opens the next state.
    pub async fn confirm_identity(&self, did: &Did) -> Result<ConfirmOutcome> {
        let publishing = self.states.states(did)?.into_iter().find(|s| s.status == StateStatus::Publishing);
        let Some(state) = publishing else {
            return Ok(ConfirmOutcome::Idle);
        };
        let tx_id = state
            .tx_id
            .clone()
            .ok_or_else(|| IssuerError::Internal(format!("publishing state {} of {} has no transaction", state.seq, did)))?;

        let status = match retry_with_backoff(&self.retry, "anchor status", || self.anchor.status(&tx_id)).await {
            Ok(status) => status,
            Err(AnchorError::UnknownTransaction(_)) => AnchorStatus::Failed { reason: format!("transaction {} unknown to the anchor", tx_id) },
            Err(e) => return Err(e.into()),
        };

        match status {
            AnchorStatus::Pending => {
                debug!("{} of {} still pending", tx_id, did);
                Ok(ConfirmOutcome::Pending)
            }
            AnchorStatus::Confirmed { block, timestamp } => {
                let confirmed = self.states.mark_confirmed(did, state.seq, block, timestamp).await?;
                self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(did);
                if let Some(hash) = confirmed.state {
                    self.events.publish(Event::StateConfirmed { issuer: did.clone(), state: hash, block });
                }
                Ok(ConfirmOutcome::Confirmed(confirmed))
            }
            AnchorStatus::Failed { reason } => {
                self.states.mark_failed(did, state.seq, &reason).await?;
                Ok(ConfirmOutcome::Failed(reason))
            }
        }
    }

    /// Puts the latest failed state back to pending and submits it again.
    ///
    /// # Errors
    ///
    /// `UnknownState` when nothing has failed, `Quarantined` for a
    /// quarantined identity, plus every error of [`Publisher::publish_identity`].
    pub async fn retry(&self, did: &Did) -> Result<IdentityState> {
        self.states.retry(did).await?;
        self.publish_identity(did).await
    }

    /// Whether the backoff of `did` has elapsed at `now`.
    fn retry_due(&self, did: &Did, now: Instant) -> bool {
        let backoff = self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        backoff.get(did).map_or(true, |b| b.next_at <= now)
    }

    /// Counts an automatic retry of `did` and pushes its next one further out.
    fn schedule_next_retry(&self, did: &Did) -> u32 {
        let mut backoff = self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = backoff.entry(did.clone()).or_insert(Backoff { attempts: 0, next_at: Instant::now() });
        entry.next_at = Instant::now() + self.retry.delay_for(entry.attempts);
        entry.attempts += 1;
        entry.attempts
    }

    fn candidates(&self, wanted: impl Fn(&[IdentityState]) -> bool) -> Result<Vec<Did>> {
        let mut out = Vec::new();
        for identity in self.states.identities()? {
            if identity.quarantined {
                continue;
            }
            if wanted(&self.states.states(&identity.did)?) {
                out.push(identity.did);
            }
        }
        Ok(out)
    }

    /// One pass over the `to_publish` queue. Returns how many identities were submitted.
    pub async fn publish_all(self: &Arc<Self>) -> usize {
        let queue = match self.candidates(|states| {
            states.iter().any(|s| s.status == StateStatus::Pending)
                || states.iter().any(|s| s.status == StateStatus::Created && s.mutations > 0)
        }) {
            Ok(queue) => queue,
            Err(e) => {
                error!("cannot scan identities to publish: {}", e);
                return 0;
            }
        };
        self.fan_out(queue, |publisher, did| async move {
            match publisher.publish_identity(&did).await {
                Ok(state) => {
                    info!("published state {:?} of {}", state.state, did);
                    true
                }
                Err(IssuerError::NothingToPublish) | Err(IssuerError::PublicationInFlight) => false,
                Err(e) => {
                    warn!("publication of {} failed: {}", did, e);
                    false
                }
            }
        })
        .await
    }

    /// One pass over the `to_retry` queue: every identity whose latest
    /// anchoring failed and whose backoff has elapsed is resubmitted with the
    /// same state hash. Returns how many identities were resubmitted.
    pub async fn retry_all(self: &Arc<Self>) -> usize {
        let queue = match self.candidates(|states| states.iter().any(|s| matches!(s.status, StateStatus::Failed(_)))) {
            Ok(queue) => queue,
            Err(e) => {
                error!("cannot scan identities to retry: {}", e);
                return 0;
            }
        };
        let now = Instant::now();
        let queue: Vec<Did> = queue.into_iter().filter(|did| self.retry_due(did, now)).collect();
        self.fan_out(queue, |publisher, did| async move {
            let attempt = publisher.schedule_next_retry(&did);
            match publisher.retry(&did).await {
                Ok(state) => {
                    info!("resubmitted state {:?} of {} (automatic retry {})", state.state, did, attempt);
                    true
                }
                Err(IssuerError::PublicationInFlight) => false,
                Err(e) => {
                    warn!("automatic retry {} of {} failed: {}", attempt, did, e);
                    false
                }
            }
        })
        .await
    }

    /// One pass over the `to_confirm` queue. Returns how many states were confirmed.
    pub async fn confirm_all(self: &Arc<Self>) -> usize {
        let queue = match self.candidates(|states| states.iter().any(|s| s.status == StateStatus::Publishing)) {
            Ok(queue) => queue,
            Err(e) => {
                error!("cannot scan identities to confirm: {}", e);
                return 0;
            }
        };
        self.fan_out(queue, |publisher, did| async move {
            match publisher.confirm_identity(&did).await {
                Ok(ConfirmOutcome::Confirmed(_)) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!("confirmation of {} failed: {}", did, e);
                    false
                }
            }
        })
        .await
    }

    async fn fan_out<F, Fut>(self: &Arc<Self>, queue: Vec<Did>, job: F) -> usize
    where
        F: Fn(Arc<Self>, Did) -> Fut,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut set = JoinSet::new();
        for did in queue {
            let permits = permits.clone();
            let work = job(self.clone(), did);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                work.await
            });
        }
        let mut done = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => done += 1,
                Ok(false) => {}
                Err(e) => error!("publisher worker panicked: {}", e),
            }
        }
        done
    }

    /// Spawns the publish, confirm and retry loops. All stop when `shutdown`
    /// flips to `true`; a pass already running finishes first.
    pub fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let publish = {
            let publisher = self.clone();
            let period = Duration::from_millis(self.settings.publish_interval_ms.max(1));
            tokio::spawn(worker_loop("publish", period, shutdown.clone(), move || {
                let publisher = publisher.clone();
                async move {
                    publisher.publish_all().await;
                }
            }))
        };
        let confirm = {
            let publisher = self.clone();
            let period = Duration::from_millis(self.settings.confirm_interval_ms.max(1));
            tokio::spawn(worker_loop("confirm", period, shutdown.clone(), move || {
                let publisher = publisher.clone();
                async move {
                    publisher.confirm_all().await;
                }
            }))
        };
        let retry = {
            let publisher = self.clone();
            let period = Duration::from_millis(self.settings.retry_interval_ms.max(1));
            tokio::spawn(worker_loop("retry", period, shutdown, move || {
                let publisher = publisher.clone();
                async move {
                    publisher.retry_all().await;
                }
            }))
        };
        vec![publish, confirm, retry]
    }
}

async fn worker_loop<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, pass: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    info!("{} worker started (every {:?})", name, period);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = interval.tick() => pass().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("{} worker stopped", name);
}
