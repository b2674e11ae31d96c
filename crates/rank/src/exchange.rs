//! One rank's side of the donation protocol.
//!
//! A [`RankExchange`] owns the rank's task queue and a sender to its peers.
//! Donations go out as `DONATION_BUNDLE` messages and stay in flight until
//! the destination answers with a `DONATION_RECEIPT` carrying the bundle's
//! correlation id: an accepted receipt releases the donor's reference claims,
//! a refused one (or a failed send) reclaims the tasks. Each donated query
//! stays locked on the donor until the rank that drained it sends
//! `DONATION_SETTLED`.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use canopy_core::config::DonationConfig;
use canopy_core::{Config, FragmentIdentity, RankId};
use canopy_exchange::{
    import_donation, BuildOutcome, DonationBundle, LargestWorkFirst, PendingDonation,
    PriorityPolicy, Settled, SubTreeFragment, Task, TaskQueue,
};
use canopy_transport::{
    topics, DonationReceipt, DonationSettled, Message, RankSender, WorkRequest, ENVELOPE_VERSION,
};

use crate::error::ExchangeError;
use crate::metrics::ExchangeMetrics;

/// What the caller's receive loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

pub struct RankExchange<S: RankSender, P: PriorityPolicy = LargestWorkFirst> {
    config: DonationConfig,
    queue: TaskQueue<P>,
    sender: S,
    in_flight: HashMap<Uuid, PendingDonation>,
    round_shipped: u64,
    metrics: ExchangeMetrics,
}

impl<S: RankSender> RankExchange<S, LargestWorkFirst> {
    pub fn new(config: &Config, sender: S) -> Self {
        let queue = TaskQueue::new(config.rank.rank, config.cache.max_points);
        Self::with_queue(config.donation.clone(), queue, sender)
    }
}

impl<S: RankSender, P: PriorityPolicy> RankExchange<S, P> {
    pub fn with_queue(config: DonationConfig, queue: TaskQueue<P>, sender: S) -> Self {
        Self {
            config,
            queue,
            sender,
            in_flight: HashMap::new(),
            round_shipped: 0,
            metrics: ExchangeMetrics::default(),
        }
    }

    pub fn rank(&self) -> RankId {
        self.queue.rank()
    }

    pub fn queue(&self) -> &TaskQueue<P> {
        &self.queue
    }

    /// Direct access for seeding queries and tasks.
    pub fn queue_mut(&mut self) -> &mut TaskQueue<P> {
        &mut self.queue
    }

    pub fn metrics(&self) -> &ExchangeMetrics {
        &self.metrics
    }

    /// Donations shipped and not yet answered by a receipt.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Reset the per-round shipping allowance.
    pub fn begin_round(&mut self) {
        self.round_shipped = 0;
    }

    pub fn round_remaining(&self) -> u64 {
        self.config.round_points.saturating_sub(self.round_shipped)
    }

    /// Whether there is a task this rank could visit right now.
    pub fn has_runnable_work(&self) -> bool {
        !self.queue.candidates().is_empty()
    }

    /// Nothing queued here and no donation waiting for a receipt.
    pub fn is_quiescent(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    // ── Donating ──────────────────────────────────────────────

    /// Pack candidates for `destination` into a bundle of at most `budget`
    /// points, further capped by the per-donation and per-round budgets.
    /// Returns `None` when nothing could be donated.
    pub fn build_donation(
        &mut self,
        destination: RankId,
        budget: u64,
    ) -> Result<Option<DonationBundle>, ExchangeError> {
        if destination == self.rank() {
            warn!(rank = %self.rank(), "refusing to donate to self");
            return Ok(None);
        }
        let budget = budget
            .min(self.config.donation_points)
            .min(self.round_remaining());
        if budget == 0 {
            debug!(rank = %self.rank(), %destination, "no donation budget left this round");
            return Ok(None);
        }

        let mut bundle = DonationBundle::new(self.rank(), destination, budget)
            .include_reverse_permutation(self.config.serialize_reverse_permutation);
        for query in self.queue.candidates() {
            if bundle.remaining_budget() == 0 {
                break;
            }
            match bundle.try_add_query(&mut self.queue, query)? {
                BuildOutcome::Donated { .. } => {}
                BuildOutcome::Void => self.metrics.void_attempts += 1,
                BuildOutcome::QueryRejected(_) => self.metrics.rejected_queries += 1,
            }
        }

        Ok((!bundle.is_empty()).then_some(bundle))
    }

    /// Encode `bundle` and hand it to the transport. On success the donation
    /// is in flight under the returned correlation id. On failure it has
    /// already been reclaimed.
    #[instrument(skip_all, fields(rank = %self.rank(), destination = %bundle.destination()))]
    pub async fn ship(&mut self, bundle: DonationBundle) -> Result<Uuid, ExchangeError> {
        let destination = bundle.destination();
        let (bytes, pending) = bundle.export();
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                self.reclaim(pending)?;
                return Err(e.into());
            }
        };

        let message = Message::raw(topics::DONATION_BUNDLE, self.rank(), bytes);
        let correlation_id = message.correlation_id;
        let size = message.payload.len();
        if let Err(e) = self.sender.send_to(destination, message).await {
            warn!(error = %e, "bundle send failed, reclaiming");
            self.reclaim(pending)?;
            return Err(e.into());
        }

        self.round_shipped += pending.points();
        self.metrics.record_sent(pending.points(), pending.work());
        info!(
            %correlation_id,
            bytes = size,
            points = pending.points(),
            work = pending.work(),
            queries = pending.queries().len(),
            "donation shipped"
        );
        self.in_flight.insert(correlation_id, pending);
        Ok(correlation_id)
    }

    /// Build and ship in one step.
    pub async fn donate(
        &mut self,
        destination: RankId,
        budget: u64,
    ) -> Result<Option<Uuid>, ExchangeError> {
        match self.build_donation(destination, budget)? {
            Some(bundle) => Ok(Some(self.ship(bundle).await?)),
            None => Ok(None),
        }
    }

    fn reclaim(&mut self, pending: PendingDonation) -> Result<(), ExchangeError> {
        pending.reclaim(&mut self.queue)?;
        self.metrics.reclaimed += 1;
        Ok(())
    }

    // ── Inbound ───────────────────────────────────────────────

    /// Import a bundle and answer its sender. An import that fails leaves
    /// the queue untouched and is reported back as a refusal.
    #[instrument(skip_all, fields(rank = %self.rank(), source = %message.source))]
    pub async fn receive_bundle(&mut self, message: &Message) -> Result<(), ExchangeError> {
        let receipt = match import_donation(&mut self.queue, &message.payload) {
            Ok(imported) => {
                self.metrics.record_received(&imported);
                DonationReceipt {
                    from: self.rank(),
                    accepted: true,
                    reason: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "donation import aborted");
                self.metrics.aborted_imports += 1;
                DonationReceipt {
                    from: self.rank(),
                    accepted: false,
                    reason: Some(e.to_string()),
                }
            }
        };
        self.send(message.source, topics::DONATION_RECEIPT, &receipt, Some(message.correlation_id))
            .await
    }

    /// Resolve the in-flight donation a receipt answers.
    pub fn on_receipt(&mut self, message: &Message) -> Result<(), ExchangeError> {
        let receipt: DonationReceipt = message.decode()?;
        let Some(pending) = self.in_flight.remove(&message.correlation_id) else {
            warn!(
                rank = %self.rank(),
                from = %receipt.from,
                correlation_id = %message.correlation_id,
                "receipt for unknown donation"
            );
            return Ok(());
        };

        if receipt.accepted {
            let queries = pending.release_cache(&mut self.queue)?;
            debug!(rank = %self.rank(), from = %receipt.from, queries = queries.len(), "donation accepted");
        } else {
            warn!(
                rank = %self.rank(),
                from = %receipt.from,
                reason = receipt.reason.as_deref().unwrap_or("unspecified"),
                "donation refused, reclaiming"
            );
            self.reclaim(pending)?;
        }
        Ok(())
    }

    /// A peer drained one of our donated queries. If that retires a query we
    /// had imported ourselves, pass the settlement on to its origin.
    pub async fn on_settled(&mut self, message: &Message) -> Result<(), ExchangeError> {
        let settled: DonationSettled = message.decode()?;
        self.metrics.settlements_received += 1;
        let Some(query) = self.queue.find_query(settled.query) else {
            warn!(rank = %self.rank(), query = %settled.query, from = %settled.from, "settlement for unknown query");
            return Ok(());
        };
        let origin = self.queue.origin(query);

        match self.queue.settle(query)? {
            Settled::Retired => {
                debug!(rank = %self.rank(), query = %settled.query, "donated query retired");
                if let Some(origin) = origin.filter(|o| *o != self.rank()) {
                    self.notify_settled(origin, settled.query).await?;
                }
            }
            Settled::Resumed => {
                debug!(rank = %self.rank(), query = %settled.query, "donated query resumed locally");
            }
        }
        Ok(())
    }

    // ── Local work ────────────────────────────────────────────

    /// Visit up to `max_tasks` tasks in priority order, handing each
    /// query/reference pair to `visit`. Returns the work visited.
    pub fn visit_tasks<F>(&mut self, max_tasks: usize, mut visit: F) -> Result<u64, ExchangeError>
    where
        F: FnMut(&SubTreeFragment, &SubTreeFragment, &Task),
    {
        let mut visited = 0usize;
        let mut work = 0u64;
        'queries: for query in self.queue.candidates() {
            while visited < max_tasks {
                let Some(task) = self.queue.pop_highest_priority(query)? else {
                    continue 'queries;
                };
                if let (Some(q), Some(r)) = (
                    self.queue.query_fragment(query),
                    self.queue.cache().fragment(task.reference_slot),
                ) {
                    visit(q, r, &task);
                }
                work += task.work;
                visited += 1;
                self.queue.finish_task(task)?;
            }
            break;
        }
        self.metrics.work_visited += work;
        Ok(work)
    }

    /// Retire every unlocked query with nothing left to do. Imported queries
    /// are reported to the rank they came from.
    pub async fn drain_settlements(&mut self) -> Result<usize, ExchangeError> {
        let drained: Vec<_> = self
            .queue
            .queries()
            .filter(|q| !self.queue.is_locked(*q) && self.queue.task_count(*q) == 0)
            .collect();

        for &query in &drained {
            let origin = self.queue.origin(query);
            let identity = self.queue.query_identity(query);
            self.queue.retire_query(query)?;
            if let (Some(origin), Some(identity)) = (origin, identity) {
                if origin != self.rank() {
                    self.notify_settled(origin, identity).await?;
                }
            }
        }
        Ok(drained.len())
    }

    async fn notify_settled(
        &mut self,
        origin: RankId,
        query: FragmentIdentity,
    ) -> Result<(), ExchangeError> {
        let settled = DonationSettled {
            from: self.rank(),
            query,
        };
        self.send(origin, topics::DONATION_SETTLED, &settled, None).await?;
        self.metrics.settlements_sent += 1;
        debug!(rank = %self.rank(), %origin, %query, "settlement sent");
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Ask `peer` for up to `budget` points of work.
    pub async fn request_work(&mut self, peer: RankId, budget: u64) -> Result<(), ExchangeError> {
        let request = WorkRequest {
            from: self.rank(),
            budget,
        };
        self.send(peer, topics::WORK_REQUEST, &request, None).await
    }

    /// Route one inbound message to its handler.
    pub async fn handle_message(&mut self, message: Message) -> Result<Control, ExchangeError> {
        if !message.is_current_version() {
            warn!(
                rank = %self.rank(),
                source = %message.source,
                topic = %message.topic,
                version = message.version,
                expected = ENVELOPE_VERSION,
                "ignoring envelope of another version"
            );
            self.metrics.ignored_messages += 1;
            return Ok(Control::Continue);
        }
        match message.topic.as_str() {
            topics::DONATION_BUNDLE => self.receive_bundle(&message).await?,
            topics::DONATION_RECEIPT => self.on_receipt(&message)?,
            topics::DONATION_SETTLED => self.on_settled(&message).await?,
            topics::WORK_REQUEST => {
                let request: WorkRequest = message.decode()?;
                if self.donate(request.from, request.budget).await?.is_none() {
                    debug!(rank = %self.rank(), from = %request.from, "nothing to donate");
                }
            }
            topics::SHUTDOWN => return Ok(Control::Shutdown),
            other => warn!(rank = %self.rank(), topic = %other, "unexpected topic"),
        }
        Ok(Control::Continue)
    }

    /// Tell every other rank of a `world_size` world to stop.
    pub async fn broadcast_shutdown(&self, world_size: u32) -> Result<(), ExchangeError> {
        for peer in (0..world_size).map(RankId).filter(|r| *r != self.rank()) {
            let message = Message::raw(topics::SHUTDOWN, self.rank(), Vec::new());
            self.sender.send_to(peer, message).await?;
        }
        info!(rank = %self.rank(), world_size, "shutdown broadcast");
        Ok(())
    }

    async fn send<T: Serialize>(
        &self,
        to: RankId,
        topic: &str,
        payload: &T,
        correlation_id: Option<Uuid>,
    ) -> Result<(), ExchangeError> {
        let mut message = Message::new(topic, self.rank(), payload)?;
        if let Some(id) = correlation_id {
            message = message.correlated(id);
        }
        self.sender.send_to(to, message).await?;
        Ok(())
    }
}
