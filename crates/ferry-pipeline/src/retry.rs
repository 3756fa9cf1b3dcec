use rand::Rng;
use std::time::Duration;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub(crate) fn jittered(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Jittered exponential backoff for IMAP fetch attempt `attempt` (1-based):
/// 1s doubling to a 30s cap.
pub(crate) fn fetch_delay(attempt: usize) -> Duration {
    let exp = attempt.saturating_sub(1).min(5) as u32;
    jittered((BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_CAP))
}

/// Backoff before the next Gmail ingest attempt. A server-provided
/// `Retry-After` hint overrides the computed delay.
pub(crate) fn ingest_delay(attempt: usize, hint: Option<Duration>) -> Duration {
    if let Some(hint) = hint {
        return hint;
    }
    fetch_delay(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        for (attempt, floor) in [(1, 1), (2, 2), (3, 4), (4, 8), (6, 30), (12, 30)] {
            let delay = fetch_delay(attempt);
            assert!(delay >= Duration::from_secs(floor));
            assert!(delay < Duration::from_secs(floor) + Duration::from_millis(250));
        }
    }

    #[test]
    fn server_hint_overrides_backoff() {
        assert_eq!(
            ingest_delay(1, Some(Duration::from_secs(9))),
            Duration::from_secs(9)
        );
        let computed = ingest_delay(3, None);
        assert!(computed >= Duration::from_secs(4));
    }
}
