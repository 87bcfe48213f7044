//! プロバイダー呼び出しとストア書き込みの再試行ポリシー。
//!
//! 指数バックオフはAWS推奨のFull Jitter戦略を使用します。
use std::time::Duration;

use rand::Rng;

use crate::error::ProviderError;

/// 再試行間隔の計算方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// 毎回同じ間隔で再スケジュールする。
    Fixed(Duration),
    /// base * 2^(attempt-1) を上限capで切り詰め、0..=その値からランダムに選ぶ。
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// 指定された再試行回数（1から開始）に対する遅延時間を計算する。
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                if attempt == 0 {
                    return Duration::ZERO;
                }

                let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
                let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);

                let exponential_delay =
                    base_ms.saturating_mul(1_u64.checked_shl(attempt - 1).unwrap_or(u64::MAX));
                let capped_delay = exponential_delay.min(cap_ms);

                let jittered_delay = if capped_delay > 0 {
                    rand::rng().random_range(0..=capped_delay)
                } else {
                    0
                };

                Duration::from_millis(jittered_delay)
            }
        }
    }
}

/// 再試行の判定結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// `attempt` 回目の再試行を `after` 後に再スケジュールする。
    Retry { attempt: u32, after: Duration },
    /// 上限到達、または再試行しても意味のないエラー。
    GiveUp,
}

/// 1つのブランチに適用する再試行ポリシー。
///
/// `max_retries` は初回呼び出しを含まない再試行回数の上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    #[must_use]
    pub const fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    #[must_use]
    pub const fn exponential(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, cap },
        }
    }

    /// `attempt` 回目（0が初回）の呼び出しが `error` で失敗した後の扱いを決める。
    ///
    /// 一時的なエラー（`Graceful`、`NotReady`）は上限まで再試行する。
    /// 入力エラーは即座に打ち切る。
    #[must_use]
    pub fn decide(&self, attempt: u32, error: &ProviderError) -> RetryDecision {
        if !error.is_transient() || !self.can_retry(attempt) {
            return RetryDecision::GiveUp;
        }
        let next = attempt + 1;
        RetryDecision::Retry {
            attempt: next,
            after: self.backoff.delay_for_attempt(next),
        }
    }

    /// この試行回数がまだ再試行可能かどうかを判定する。
    #[must_use]
    pub const fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graceful() -> ProviderError {
        ProviderError::graceful("tineye", "503 Service Unavailable")
    }

    #[test]
    fn exponential_delay_for_attempt_zero_is_zero() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn exponential_delay_grows_and_respects_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(500),
        };

        assert!(backoff.delay_for_attempt(1) <= Duration::from_millis(100));
        assert!(backoff.delay_for_attempt(2) <= Duration::from_millis(200));
        assert!(backoff.delay_for_attempt(3) <= Duration::from_millis(400));
        assert!(backoff.delay_for_attempt(40) <= Duration::from_millis(500));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(19), Duration::from_secs(5));
    }

    #[test]
    fn decide_retries_until_ceiling() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));

        assert_eq!(
            policy.decide(0, &graceful()),
            RetryDecision::Retry {
                attempt: 1,
                after: Duration::from_secs(1)
            }
        );
        assert!(matches!(
            policy.decide(2, &graceful()),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert_eq!(policy.decide(3, &graceful()), RetryDecision::GiveUp);
    }

    #[test]
    fn not_ready_is_never_downgraded_before_ceiling() {
        let policy = RetryPolicy::fixed(20, Duration::from_secs(5));
        let not_ready = ProviderError::NotReady {
            provider: "incandescent",
        };

        for attempt in 0..20 {
            assert!(matches!(
                policy.decide(attempt, &not_ready),
                RetryDecision::Retry { .. }
            ));
        }
        assert_eq!(policy.decide(20, &not_ready), RetryDecision::GiveUp);
    }

    #[test]
    fn invalid_input_gives_up_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let error = ProviderError::invalid_input("izitru", "not an image");
        assert_eq!(policy.decide(0, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn full_jitter_provides_variation() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
        };

        let delays: Vec<Duration> = (0..10).map(|_| backoff.delay_for_attempt(5)).collect();

        let all_same = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "jitter should produce varying delays");
    }
}
