pub mod subscription_sync;

pub use subscription_sync::{compute_delta, reconcile_subscriptions, run_subscription_sync, SubscriptionDelta};
