pub mod ws_listener;

pub use ws_listener::{
    backoff_delay, parse_feed_message, FeedConfig, FeedError, FeedFrame, FeedHandle, FeedState,
    FeedSubscriber, SubscriptionSet,
};
