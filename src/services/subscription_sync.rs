use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::gauge;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::db::{RelationshipStore, StoreError};
use crate::ingestion::FeedHandle;

/// Wallets to add to and drop from the feed subscription set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

impl SubscriptionDelta {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

pub fn compute_delta(current: &BTreeSet<String>, desired: &BTreeSet<String>) -> SubscriptionDelta {
    SubscriptionDelta {
        subscribe: desired.difference(current).cloned().collect(),
        unsubscribe: current.difference(desired).cloned().collect(),
    }
}

/// Bring the feed's subscription set in line with the masters that have
/// active relationships.
pub async fn reconcile_subscriptions(
    store: &dyn RelationshipStore,
    feed: &FeedHandle,
) -> Result<SubscriptionDelta, StoreError> {
    let desired: BTreeSet<String> = store.list_active_master_wallets().await?.into_iter().collect();
    let delta = compute_delta(&feed.subscriptions(), &desired);

    for wallet in &delta.subscribe {
        feed.subscribe(wallet);
    }
    for wallet in &delta.unsubscribe {
        feed.unsubscribe(wallet);
    }

    gauge!("subscribed_masters").set(desired.len() as f64);

    if !delta.is_empty() {
        tracing::info!(
            added = delta.subscribe.len(),
            removed = delta.unsubscribe.len(),
            total = desired.len(),
            "Feed subscriptions reconciled"
        );
    }

    Ok(delta)
}

/// Reconcile on a fixed interval and whenever `trigger` fires, until
/// shutdown. The first pass runs immediately.
pub async fn run_subscription_sync(
    store: Arc<dyn RelationshipStore>,
    feed: FeedHandle,
    interval_secs: u64,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => {
                tracing::debug!("Relationship change — reconciling now");
            }
            _ = shutdown.changed() => break,
        }

        if let Err(e) = reconcile_subscriptions(store.as_ref(), &feed).await {
            tracing::error!(error = %e, "Subscription reconcile failed");
        }
    }

    tracing::info!("Subscription sync stopped");
}
