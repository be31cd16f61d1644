use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldTable};
use std::time::Duration;

const DEFAULT_CONCURRENCY: usize = 20;
const ENV_CONCURRENCY: &str = "RABBITMQ_CONCURRENCY";

const DEFAULT_MAX_RETRIES: i64 = 10;
const ENV_MAX_RETRIES: &str = "RABBITMQ_MAX_RETRIES";

const DEFAULT_RETRY_EXCHANGE_PREFIX: &str = "cleanapp-retry.";
const ENV_RETRY_EXCHANGE_PREFIX: &str = "RABBITMQ_RETRY_EXCHANGE_PREFIX";

/// Reserved header counting how many times a message has been republished to
/// the retry exchange. Survives channel drops and process restarts, unlike
/// the broker's redelivered flag.
pub const RETRY_COUNT_HEADER: &str = "x-cleanapp-retry-count";

pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), MAX_BACKOFF)
}

pub(crate) fn rabbitmq_concurrency() -> usize {
    parse_concurrency(std::env::var(ENV_CONCURRENCY).ok())
}

fn parse_concurrency(raw: Option<String>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_CONCURRENCY;
    };
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            log::warn!(
                "rabbitmq: invalid {}={:?}, using default={}",
                ENV_CONCURRENCY,
                raw,
                DEFAULT_CONCURRENCY
            );
            DEFAULT_CONCURRENCY
        }
    }
}

pub(crate) fn rabbitmq_max_retries() -> i64 {
    parse_max_retries(std::env::var(ENV_MAX_RETRIES).ok())
}

fn parse_max_retries(raw: Option<String>) -> i64 {
    let Some(raw) = raw else {
        return DEFAULT_MAX_RETRIES;
    };
    match raw.parse::<i64>() {
        Ok(n) if n >= 0 => n,
        _ => {
            log::warn!(
                "rabbitmq: invalid {}={:?}, using default={}",
                ENV_MAX_RETRIES,
                raw,
                DEFAULT_MAX_RETRIES
            );
            DEFAULT_MAX_RETRIES
        }
    }
}

pub(crate) fn retry_exchange_prefix() -> String {
    std::env::var(ENV_RETRY_EXCHANGE_PREFIX)
        .unwrap_or_else(|_| DEFAULT_RETRY_EXCHANGE_PREFIX.to_string())
}

pub(crate) fn retry_exchange_for_queue(prefix: &str, queue: &str) -> String {
    format!("{}{}", prefix, queue)
}

/// Reads the retry counter from message headers.
///
/// AMQP clients encode header integers with whatever width they please, so
/// every integer encoding plus decimal strings decode to the same logical
/// value. Absent, malformed or negative values decode as 0; unsigned values
/// beyond `i64::MAX` clamp.
pub(crate) fn retry_count_from_headers(headers: &Option<FieldTable>) -> i64 {
    let Some(headers) = headers.as_ref() else {
        return 0;
    };
    let Some(value) = headers.inner().get(RETRY_COUNT_HEADER) else {
        return 0;
    };
    decode_retry_count(value)
}

fn decode_retry_count(value: &AMQPValue) -> i64 {
    let n = match value {
        AMQPValue::ShortShortInt(n) => i64::from(*n),
        AMQPValue::ShortShortUInt(n) => i64::from(*n),
        AMQPValue::ShortInt(n) => i64::from(*n),
        AMQPValue::ShortUInt(n) => i64::from(*n),
        AMQPValue::LongInt(n) => i64::from(*n),
        AMQPValue::LongUInt(n) => i64::from(*n),
        AMQPValue::LongLongInt(n) => *n,
        AMQPValue::Timestamp(n) => i64::try_from(*n).unwrap_or(i64::MAX),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(0),
        AMQPValue::ShortString(s) => s.as_str().trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    n.max(0)
}

/// Returns a copy of the properties with the retry counter set to `next`.
/// All other headers and properties are preserved.
pub(crate) fn with_retry_count(props: BasicProperties, next: i64) -> BasicProperties {
    let mut headers = props.headers().as_ref().cloned().unwrap_or_default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(next));
    props.with_headers(headers)
}

#[derive(Debug)]
pub struct PermanentError {
    err: Box<dyn std::error::Error + Send + Sync>,
}

impl PermanentError {
    pub fn new(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self { err }
    }
}

impl std::fmt::Display for PermanentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl std::error::Error for PermanentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.err)
    }
}

/// Wrap an error as a permanent (non-retriable) error.
///
/// The subscriber will `Nack(requeue=false)`, which dead-letters if the queue
/// has a DLX configured.
pub fn permanent<E>(err: E) -> Box<dyn std::error::Error + Send + Sync>
where
    E: std::error::Error + Send + Sync + 'static,
{
    Box::new(PermanentError::new(Box::new(err)))
}

pub(crate) fn is_permanent(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    err.is::<PermanentError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: AMQPValue) -> Option<FieldTable> {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), value);
        Some(headers)
    }

    #[test]
    fn test_retry_count_absent_headers() {
        assert_eq!(retry_count_from_headers(&None), 0);
        assert_eq!(retry_count_from_headers(&Some(FieldTable::default())), 0);
    }

    #[test]
    fn test_retry_count_integer_encodings() {
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::ShortShortInt(3))), 3);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::ShortShortUInt(4))), 4);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::ShortInt(5))), 5);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::ShortUInt(6))), 6);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::LongInt(7))), 7);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::LongUInt(8))), 8);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::LongLongInt(9))), 9);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::Timestamp(10))), 10);
    }

    #[test]
    fn test_retry_count_decimal_strings() {
        assert_eq!(
            retry_count_from_headers(&headers_with(AMQPValue::LongString("12".into()))),
            12
        );
        assert_eq!(
            retry_count_from_headers(&headers_with(AMQPValue::LongString(" 2 ".into()))),
            2
        );
        assert_eq!(
            retry_count_from_headers(&headers_with(AMQPValue::LongString("garbage".into()))),
            0
        );
    }

    #[test]
    fn test_retry_count_negative_and_malformed() {
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::LongInt(-5))), 0);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::LongLongInt(-1))), 0);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::Boolean(true))), 0);
        assert_eq!(retry_count_from_headers(&headers_with(AMQPValue::Double(2.5))), 0);
    }

    #[test]
    fn test_retry_count_overflow_clamps() {
        assert_eq!(
            retry_count_from_headers(&headers_with(AMQPValue::Timestamp(u64::MAX))),
            i64::MAX
        );
    }

    #[test]
    fn test_with_retry_count_increments_and_preserves() {
        let props = BasicProperties::default().with_content_type("application/json".into());
        let props = with_retry_count(props, 1);
        assert_eq!(retry_count_from_headers(props.headers()), 1);
        assert_eq!(
            props.content_type().as_ref().map(|s| s.to_string()),
            Some("application/json".to_string())
        );

        // A second republish overwrites the counter in place.
        let props = with_retry_count(props, 2);
        assert_eq!(retry_count_from_headers(props.headers()), 2);
    }

    #[test]
    fn test_retry_exchange_name() {
        assert_eq!(
            retry_exchange_for_queue("cleanapp-retry.", "analysis_queue"),
            "cleanapp-retry.analysis_queue"
        );
    }

    #[test]
    fn test_parse_concurrency() {
        assert_eq!(parse_concurrency(None), DEFAULT_CONCURRENCY);
        assert_eq!(parse_concurrency(Some("8".to_string())), 8);
        assert_eq!(parse_concurrency(Some("0".to_string())), DEFAULT_CONCURRENCY);
        assert_eq!(parse_concurrency(Some("-2".to_string())), DEFAULT_CONCURRENCY);
        assert_eq!(parse_concurrency(Some("lots".to_string())), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_parse_max_retries() {
        assert_eq!(parse_max_retries(None), DEFAULT_MAX_RETRIES);
        assert_eq!(parse_max_retries(Some("0".to_string())), 0);
        assert_eq!(parse_max_retries(Some("3".to_string())), 3);
        assert_eq!(parse_max_retries(Some("-1".to_string())), DEFAULT_MAX_RETRIES);
        assert_eq!(parse_max_retries(Some("ten".to_string())), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_backoff_progression() {
        let mut backoff = INITIAL_BACKOFF;
        let mut observed = vec![backoff.as_secs()];
        for _ in 0..6 {
            backoff = next_backoff(backoff);
            observed.push(backoff.as_secs());
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_permanent_marker_detection() {
        let err = permanent(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad payload"));
        assert!(is_permanent(err.as_ref()));
        assert_eq!(err.to_string(), "bad payload");

        let plain: Box<dyn std::error::Error + Send + Sync> = "try again".into();
        assert!(!is_permanent(plain.as_ref()));
    }
}
