use rand::Rng;
use std::time::Duration;

const MAX_DELAY_SECS: f64 = 86_400.0;

pub fn secs_to_duration(secs: f64) -> Duration {
    if !secs.is_finite() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.clamp(0.0, MAX_DELAY_SECS))
}

/// 在 [min, max] 区间内均匀取值（秒），区间退化时直接返回下界
pub fn random_secs<R: Rng + ?Sized>(rng: &mut R, min_secs: f64, max_secs: f64) -> f64 {
    if max_secs <= min_secs {
        return min_secs;
    }
    rng.gen_range(min_secs..=max_secs)
}

pub fn random_duration<R: Rng + ?Sized>(rng: &mut R, min_secs: f64, max_secs: f64) -> Duration {
    secs_to_duration(random_secs(rng, min_secs, max_secs))
}

pub fn next_backoff(current: Duration, cap: Duration) -> Duration {
    current.saturating_mul(2).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_secs_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let v = random_secs(&mut rng, 1.3, 3.1);
            assert!((1.3..=3.1).contains(&v));
        }
    }

    #[test]
    fn test_random_secs_degenerate_range() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(random_secs(&mut rng, 2.0, 2.0), 2.0);
        assert_eq!(random_secs(&mut rng, 5.0, 1.0), 5.0);
    }

    #[test]
    fn test_secs_to_duration_clamps() {
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(0.5), Duration::from_millis(500));
    }

    #[test]
    fn test_next_backoff_caps() {
        let cap = Duration::from_secs(2);
        assert_eq!(
            next_backoff(Duration::from_millis(500), cap),
            Duration::from_secs(1)
        );
        assert_eq!(next_backoff(Duration::from_millis(1500), cap), cap);
    }
}
