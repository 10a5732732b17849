//! Correlation queue for in-flight exchanges
//!
//! Every public request or connection that is waiting on a tunnel owner is parked here
//! under its correlation id. Completion is first-writer-wins: whichever of normal
//! completion, owner abort, timeout, caller cancellation or channel loss removes the
//! entry first decides the outcome, and every later attempt is a no-op.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// How a parked exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The owner's result was fully delivered to the caller
    Completed,
    /// The owner aborted, or its control channel went away
    Failed,
    /// No result within the configured window
    TimedOut,
    /// The public caller went away
    Cancelled,
}

struct PendingExchange<C> {
    owner_id: Uuid,
    connection_id: Uuid,
    carrier: Arc<C>,
    done: oneshot::Sender<ExchangeOutcome>,
    timeout: Option<AbortHandle>,
}

/// Map of correlation id to pending exchange, generic over the carrier `C` that holds
/// whatever the relay needs to hand the result to the waiting caller.
pub struct CorrelationQueue<C> {
    exchanges: Arc<DashMap<Uuid, PendingExchange<C>>>,
}

impl<C> Clone for CorrelationQueue<C> {
    fn clone(&self) -> Self {
        Self {
            exchanges: self.exchanges.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> CorrelationQueue<C> {
    pub fn new() -> Self {
        Self {
            exchanges: Arc::new(DashMap::new()),
        }
    }

    /// Park an exchange and return the handle its caller waits on.
    ///
    /// With a timeout, the exchange completes as [`ExchangeOutcome::TimedOut`] unless
    /// something else completes it first or the timer is disarmed.
    pub fn park(
        &self,
        correlation_id: Uuid,
        owner_id: Uuid,
        connection_id: Uuid,
        carrier: Arc<C>,
        timeout: Option<Duration>,
    ) -> Parked<C> {
        let (done, rx) = oneshot::channel();
        self.exchanges.insert(
            correlation_id,
            PendingExchange {
                owner_id,
                connection_id,
                carrier,
                done,
                timeout: None,
            },
        );

        if let Some(window) = timeout {
            let queue = self.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if queue.complete(correlation_id, ExchangeOutcome::TimedOut) {
                    debug!("Exchange {} timed out after {:?}", correlation_id, window);
                }
            })
            .abort_handle();

            match self.exchanges.get_mut(&correlation_id) {
                Some(mut pending) => pending.timeout = Some(timer),
                None => timer.abort(),
            }
        }

        trace!("Parked exchange {} for owner {}", correlation_id, owner_id);
        Parked {
            correlation_id,
            queue: self.clone(),
            rx,
            outcome: None,
        }
    }

    pub fn carrier(&self, correlation_id: &Uuid) -> Option<Arc<C>> {
        self.exchanges
            .get(correlation_id)
            .map(|pending| pending.carrier.clone())
    }

    pub fn contains(&self, correlation_id: &Uuid) -> bool {
        self.exchanges.contains_key(correlation_id)
    }

    /// Stop the exchange's timer. Used once the owner has started delivering a result,
    /// so a long response body is not cut off by the request window.
    pub fn disarm_timeout(&self, correlation_id: &Uuid) {
        if let Some(mut pending) = self.exchanges.get_mut(correlation_id) {
            if let Some(timer) = pending.timeout.take() {
                timer.abort();
            }
        }
    }

    /// Complete normally. Returns `false` if the exchange was already completed.
    pub fn resolve(&self, correlation_id: Uuid) -> bool {
        self.complete(correlation_id, ExchangeOutcome::Completed)
    }

    /// Complete with a forwarding failure.
    pub fn fail(&self, correlation_id: Uuid) -> bool {
        self.complete(correlation_id, ExchangeOutcome::Failed)
    }

    /// Complete because the caller went away.
    pub fn force_cancel(&self, correlation_id: Uuid) -> bool {
        self.complete(correlation_id, ExchangeOutcome::Cancelled)
    }

    /// Fail every exchange of an owner. Returns how many were pending.
    pub fn cancel_owner(&self, owner_id: Uuid) -> usize {
        self.fail_matching(|pending| pending.owner_id == owner_id)
    }

    /// Fail every exchange bound to one physical connection.
    pub fn cancel_connection(&self, connection_id: Uuid) -> usize {
        self.fail_matching(|pending| pending.connection_id == connection_id)
    }

    fn fail_matching(&self, matches: impl Fn(&PendingExchange<C>) -> bool) -> usize {
        let ids: Vec<Uuid> = self
            .exchanges
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter().filter(|id| self.fail(*id)).count()
    }

    fn complete(&self, correlation_id: Uuid, outcome: ExchangeOutcome) -> bool {
        let Some((_, pending)) = self.exchanges.remove(&correlation_id) else {
            return false;
        };

        if outcome != ExchangeOutcome::TimedOut {
            if let Some(timer) = pending.timeout {
                timer.abort();
            }
        }
        // The waiter may already be gone (caller dropped), which is fine.
        let _ = pending.done.send(outcome);
        trace!("Exchange {} completed: {:?}", correlation_id, outcome);
        true
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

impl<C: Send + Sync + 'static> Default for CorrelationQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle held by the parked caller.
///
/// Dropping it force-cancels the exchange, which is a no-op when it already completed.
/// This is how a caller that goes away releases its entry.
pub struct Parked<C: Send + Sync + 'static> {
    correlation_id: Uuid,
    queue: CorrelationQueue<C>,
    rx: oneshot::Receiver<ExchangeOutcome>,
    outcome: Option<ExchangeOutcome>,
}

impl<C: Send + Sync + 'static> Parked<C> {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wait for the exchange to complete. Cancel-safe, and returns the same outcome on
    /// every call once completed.
    pub async fn wait(&mut self) -> ExchangeOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let outcome = (&mut self.rx).await.unwrap_or(ExchangeOutcome::Cancelled);
        self.outcome = Some(outcome);
        outcome
    }

    /// Whether the exchange already completed, without waiting.
    pub fn is_settled(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                true
            }
            Err(_) => false,
        }
    }
}

impl<C: Send + Sync + 'static> Drop for Parked<C> {
    fn drop(&mut self) {
        if self.queue.force_cancel(self.correlation_id) {
            debug!("Caller of exchange {} went away", self.correlation_id);
        }
    }
}
