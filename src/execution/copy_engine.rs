use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use uuid::Uuid;

use crate::db::RelationshipStore;
use crate::exchange::{AgentSigner, ExchangeClient, MarketInfoCache, MarketOrder};
use crate::models::{CopyRelationship, Fill, MarketInfo};
use crate::vault::CredentialVault;

use super::position_sizer;
use super::risk_manager::{self, RiskViolation};

/// Configuration for the copy engine.
#[derive(Debug, Clone)]
pub struct CopyEngineConfig {
    /// Slippage tolerance sent with every market order, in percent.
    pub slippage_percent: Decimal,
    pub dry_run: bool,
    /// Consecutive execution failures before an operator warning.
    pub failure_alert_threshold: u32,
}

impl Default for CopyEngineConfig {
    fn default() -> Self {
        Self {
            slippage_percent: Decimal::new(5, 1), // 0.5%
            dry_run: false,
            failure_alert_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SymbolFiltered,
    DecryptionFailed,
    ZeroAmount,
    InsufficientBalance,
    LeverageExhausted,
    ExposureExceeded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SymbolFiltered => "symbol_filtered",
            SkipReason::DecryptionFailed => "decryption_failed",
            SkipReason::ZeroAmount => "zero_amount",
            SkipReason::InsufficientBalance => "insufficient_balance",
            SkipReason::LeverageExhausted => "leverage_exhausted",
            SkipReason::ExposureExceeded => "exposure_exceeded",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&RiskViolation> for SkipReason {
    fn from(v: &RiskViolation) -> Self {
        match v {
            RiskViolation::ZeroAmount => SkipReason::ZeroAmount,
            RiskViolation::InsufficientBalance { .. } => SkipReason::InsufficientBalance,
            RiskViolation::LeverageExhausted { .. } => SkipReason::LeverageExhausted,
            RiskViolation::ExposureExceeded { .. } => SkipReason::ExposureExceeded,
        }
    }
}

/// What happened to one relationship for one fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    Submitted { order: MarketOrder, order_id: Option<u64> },
    DryRun { order: MarketOrder },
    Skipped(SkipReason),
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct RelationshipReport {
    pub relationship_id: Uuid,
    pub copier_wallet: String,
    pub outcome: ReplicationOutcome,
}

/// Replicates master fills into every active follower account.
pub struct CopyEngine {
    store: Arc<dyn RelationshipStore>,
    vault: Arc<dyn CredentialVault>,
    client: ExchangeClient,
    markets: Arc<MarketInfoCache>,
    config: CopyEngineConfig,
    failures: Mutex<HashMap<Uuid, u32>>,
}

impl CopyEngine {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        vault: Arc<dyn CredentialVault>,
        client: ExchangeClient,
        markets: Arc<MarketInfoCache>,
        config: CopyEngineConfig,
    ) -> Self {
        Self {
            store,
            vault,
            client,
            markets,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CopyEngineConfig {
        &self.config
    }

    /// Current consecutive failure count for a relationship.
    pub fn consecutive_failures(&self, relationship_id: Uuid) -> u32 {
        self.lock_failures().get(&relationship_id).copied().unwrap_or(0)
    }

    /// Replicate one fill across every active relationship of its master.
    /// Per-relationship problems end up in the returned reports, never as an
    /// error.
    pub async fn handle_fill(&self, fill: &Fill) -> Vec<RelationshipReport> {
        let symbol = fill.symbol.to_uppercase();
        let fill = Fill {
            symbol: symbol.clone(),
            ..fill.clone()
        };

        // 1. Market metadata (lot size), best effort
        let market = self.markets.get_or_fetch(&symbol, &self.client).await;

        // 2. Followers of this master
        let relationships = match self.store.list_active_by_master(&fill.master_wallet).await {
            Ok(rels) => rels,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    master = %fill.master_wallet,
                    "Failed to load copy relationships — fill dropped"
                );
                return Vec::new();
            }
        };

        if relationships.is_empty() {
            tracing::debug!(master = %fill.master_wallet, "No active relationships for master");
            return Vec::new();
        }

        tracing::info!(
            master = %fill.master_wallet,
            symbol = %fill.symbol,
            side = %fill.trade_side,
            followers = relationships.len(),
            "Replicating fill"
        );

        // 3. Fan out, one independent pipeline per relationship
        let reports = join_all(
            relationships
                .iter()
                .map(|rel| self.replicate_for(rel, &fill, &market)),
        )
        .await;

        let latency = (Utc::now() - fill.received_at).num_milliseconds().max(0) as f64 / 1000.0;
        histogram!("replication_latency_seconds").record(latency);

        reports
    }

    async fn replicate_for(&self, rel: &CopyRelationship, fill: &Fill, market: &MarketInfo) -> RelationshipReport {
        let outcome = self.replicate(rel, fill, market).await;

        match &outcome {
            ReplicationOutcome::Submitted { order, order_id } => {
                counter!("copy_orders_submitted_total").increment(1);
                self.record_success(rel.id);
                tracing::info!(
                    copier = %rel.copier_wallet,
                    symbol = %order.symbol,
                    side = %order.side,
                    amount = %order.amount,
                    reduce_only = order.reduce_only,
                    order_id = ?order_id,
                    "Copy order submitted"
                );
            }
            ReplicationOutcome::DryRun { order } => {
                tracing::info!(
                    copier = %rel.copier_wallet,
                    symbol = %order.symbol,
                    side = %order.side,
                    amount = %order.amount,
                    reduce_only = order.reduce_only,
                    "[DRY RUN] Copy order not submitted"
                );
            }
            ReplicationOutcome::Skipped(reason) => {
                counter!("copy_orders_skipped_total", "reason" => reason.as_str()).increment(1);
            }
            ReplicationOutcome::Failed { error } => {
                counter!("copy_orders_failed_total").increment(1);
                tracing::error!(
                    copier = %rel.copier_wallet,
                    relationship_id = %rel.id,
                    symbol = %fill.symbol,
                    error = %error,
                    "Copy order failed"
                );
                self.record_failure(rel);
            }
        }

        RelationshipReport {
            relationship_id: rel.id,
            copier_wallet: rel.copier_wallet.clone(),
            outcome,
        }
    }

    async fn replicate(&self, rel: &CopyRelationship, fill: &Fill, market: &MarketInfo) -> ReplicationOutcome {
        // a. Symbol allow-list
        if !rel.allows_symbol(&fill.symbol) {
            tracing::debug!(copier = %rel.copier_wallet, symbol = %fill.symbol, "Symbol not in allow-list");
            return ReplicationOutcome::Skipped(SkipReason::SymbolFiltered);
        }

        // b. Credential
        let secret = match self.vault.decrypt(&rel.encrypted_credential) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::warn!(
                    copier = %rel.copier_wallet,
                    relationship_id = %rel.id,
                    error = %e,
                    "Credential decryption failed — skipping relationship"
                );
                return ReplicationOutcome::Skipped(SkipReason::DecryptionFailed);
            }
        };
        let signer = match AgentSigner::from_base58(&secret) {
            Ok(signer) => signer,
            Err(e) => return ReplicationOutcome::Failed { error: e.to_string() },
        };

        // c-f. Size, multiply, cap, quantize
        let mut available = None;
        if rel.sizing.needs_balance() {
            match self.client.get_account(&rel.copier_wallet).await {
                Ok(account) => available = Some(account.available()),
                Err(e) => return ReplicationOutcome::Failed { error: e.to_string() },
            }
        }

        let sized = match position_sizer::size_order(rel, fill, market.lot_size, available) {
            Ok(sized) => sized,
            Err(e) => return ReplicationOutcome::Failed { error: e.to_string() },
        };
        tracing::debug!(
            copier = %rel.copier_wallet,
            sizing = %rel.sizing,
            base = %sized.base,
            adjusted = %sized.adjusted,
            amount = %sized.amount,
            "Copy order sized"
        );

        let mut amount = sized.amount;
        if amount <= Decimal::ZERO {
            return self.skip(rel, &RiskViolation::ZeroAmount);
        }

        // g. Balance
        let available = match available {
            Some(balance) => balance,
            None => match self.client.get_account(&rel.copier_wallet).await {
                Ok(account) => account.available(),
                Err(e) => return ReplicationOutcome::Failed { error: e.to_string() },
            },
        };
        if let Err(v) = risk_manager::check_balance(amount * fill.price, available) {
            return self.skip(rel, &v);
        }

        // h. Leverage cap
        if let Some(leverage) = rel.max_leverage {
            match risk_manager::clamp_to_leverage(amount, fill.price, available, leverage, market.lot_size) {
                Ok(clamped) => amount = clamped,
                Err(v) => return self.skip(rel, &v),
            }
        }

        // i. Total exposure
        if let Some(limit) = rel.max_total_exposure {
            let positions = match self.client.get_positions(&rel.copier_wallet).await {
                Ok(positions) => positions,
                Err(e) => return ReplicationOutcome::Failed { error: e.to_string() },
            };
            if let Err(v) = risk_manager::check_exposure(&positions, amount * fill.price, limit) {
                return self.skip(rel, &v);
            }
        }

        // j. Side and reduce-only from the trade tag
        let order = MarketOrder {
            symbol: fill.symbol.clone(),
            amount,
            side: fill.trade_side.order_side(),
            slippage_percent: self.config.slippage_percent,
            reduce_only: fill.trade_side.is_reduce_only(),
            client_order_id: Some(Uuid::new_v4().to_string()),
        };

        if self.config.dry_run {
            return ReplicationOutcome::DryRun { order };
        }

        // k. Submit
        match self.client.create_market_order(&signer, &rel.copier_wallet, &order).await {
            Ok(ack) => ReplicationOutcome::Submitted {
                order,
                order_id: ack.order_id,
            },
            Err(e) => ReplicationOutcome::Failed {
                error: format!("{} ({})", e, e.kind()),
            },
        }
    }

    fn skip(&self, rel: &CopyRelationship, violation: &RiskViolation) -> ReplicationOutcome {
        tracing::info!(
            copier = %rel.copier_wallet,
            relationship_id = %rel.id,
            violation = %violation,
            "Copy order skipped"
        );
        ReplicationOutcome::Skipped(SkipReason::from(violation))
    }

    fn record_success(&self, id: Uuid) {
        self.lock_failures().remove(&id);
    }

    fn record_failure(&self, rel: &CopyRelationship) {
        let count = {
            let mut failures = self.lock_failures();
            let count = failures.entry(rel.id).or_insert(0);
            *count += 1;
            *count
        };
        if count == self.config.failure_alert_threshold {
            tracing::warn!(
                copier = %rel.copier_wallet,
                master = %rel.master_wallet,
                relationship_id = %rel.id,
                consecutive_failures = count,
                "Copy relationship keeps failing — operator attention needed"
            );
        }
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Per-master workers
// ---------------------------------------------------------------------------

/// How often idle master workers are retired.
const WORKER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct MasterWorker {
    tx: mpsc::UnboundedSender<Fill>,
    /// Fills queued or in progress on this worker.
    pending: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

/// One sequential worker per master wallet, spawned on that master's first
/// fill. Only the owner sends to workers, so a worker with nothing pending
/// can be dropped without losing or reordering fills.
pub struct MasterWorkers {
    engine: Arc<CopyEngine>,
    workers: HashMap<String, MasterWorker>,
    retired: Vec<JoinHandle<()>>,
}

impl MasterWorkers {
    pub fn new(engine: Arc<CopyEngine>) -> Self {
        Self {
            engine,
            workers: HashMap::new(),
            retired: Vec::new(),
        }
    }

    /// Queue a fill on its master's worker.
    pub fn dispatch(&mut self, fill: Fill) {
        let engine = &self.engine;
        let worker = self
            .workers
            .entry(fill.master_wallet.clone())
            .or_insert_with(|| spawn_master_worker(Arc::clone(engine), fill.master_wallet.clone()));

        worker.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(fill)) = worker.tx.send(fill) {
            worker.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(master = %fill.master_wallet, "Master worker gone — fill dropped");
        }
    }

    /// Drop every worker with nothing queued or running. Returns how many
    /// were retired.
    pub fn retire_idle(&mut self) -> usize {
        self.retired.retain(|handle| !handle.is_finished());

        let idle: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.pending.load(Ordering::SeqCst) == 0)
            .map(|(master, _)| master.clone())
            .collect();
        for master in &idle {
            if let Some(worker) = self.workers.remove(master) {
                // Dropping the sender ends the worker's receive loop.
                drop(worker.tx);
                self.retired.push(worker.handle);
            }
        }
        idle.len()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Close every worker and wait for its queue to finish.
    pub async fn drain(self) {
        let handles = self
            .workers
            .into_values()
            .map(|w| w.handle)
            .chain(self.retired);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Copy worker panicked");
            }
        }
    }
}

fn spawn_master_worker(engine: Arc<CopyEngine>, master: String) -> MasterWorker {
    let (tx, mut rx) = mpsc::unbounded_channel::<Fill>();
    let pending = Arc::new(AtomicUsize::new(0));
    let in_worker = Arc::clone(&pending);
    let handle = tokio::spawn(async move {
        tracing::debug!(master = %master, "Copy worker started");
        while let Some(fill) = rx.recv().await {
            engine.handle_fill(&fill).await;
            in_worker.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(master = %master, "Copy worker stopped");
    });
    MasterWorker { tx, pending, handle }
}

/// Run the copy engine loop. Fills of one master are replicated strictly in
/// arrival order by a dedicated worker; different masters run side by side.
/// Workers idle for a sweep are retired and respawned on demand. Returns once
/// the fill channel closes and every worker has drained.
pub async fn run_copy_engine(engine: Arc<CopyEngine>, mut rx: mpsc::Receiver<Fill>) {
    tracing::info!(
        dry_run = engine.config.dry_run,
        slippage_percent = %engine.config.slippage_percent,
        "Copy engine started"
    );

    let mut workers = MasterWorkers::new(engine);
    let mut sweep = interval_at(Instant::now() + WORKER_SWEEP_INTERVAL, WORKER_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            fill = rx.recv() => match fill {
                Some(fill) => workers.dispatch(fill),
                None => break,
            },
            _ = sweep.tick() => {
                let retired = workers.retire_idle();
                if retired > 0 {
                    tracing::debug!(retired, active = workers.len(), "Retired idle copy workers");
                }
            }
        }
    }

    tracing::warn!(workers = workers.len(), "Fill channel closed — draining copy workers");
    workers.drain().await;
    tracing::info!("Copy engine stopped");
}
