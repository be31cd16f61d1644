pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod subscriber;

pub use metrics::{MetricsSnapshot, SubscriberMetrics};
pub use publisher::{Publisher, PublisherError};
pub use retry::{PermanentError, RETRY_COUNT_HEADER, permanent};
pub use subscriber::{Callback, CallbackMap, Message, Subscriber, SubscriberError};
