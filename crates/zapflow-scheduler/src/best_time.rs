//! Reschedule delay for follow-ups the transport deferred (`QUEUED`).
//!
//! Precedence: an explicit cooldown constraint, then the best-time heuristic
//! for first attempts, then the regular backoff policy.

use rand::Rng;
use zapflow_core::FollowUp;

use crate::backoff::BackoffPolicy;

/// Centre of the best-time window.
pub const BEST_TIME_BASE_MINUTES: i64 = 30;
/// Maximum jitter applied either side of the centre.
pub const BEST_TIME_JITTER_MINUTES: i64 = 15;
/// Never reschedule sooner than this.
pub const BEST_TIME_FLOOR_MINUTES: i64 = 5;

/// `30 min ± up to 15 min`, floored at 5 min.
pub fn best_time_minutes<R: Rng>(rng: &mut R) -> u64 {
    let jitter = rng.gen_range(-BEST_TIME_JITTER_MINUTES..=BEST_TIME_JITTER_MINUTES);
    (BEST_TIME_BASE_MINUTES + jitter).max(BEST_TIME_FLOOR_MINUTES) as u64
}

/// Cooldown hours rounded up to whole minutes.
pub fn cooldown_minutes(hours: f64) -> u64 {
    (hours * 60.0).ceil() as u64
}

/// Delay before retrying a job whose send was deferred by the transport.
pub fn queued_delay_minutes<R: Rng>(
    job: &FollowUp,
    backoff: &BackoffPolicy,
    rng: &mut R,
) -> u64 {
    if let Some(hours) = job.constraints.as_ref().and_then(|c| c.cooldown_hours()) {
        return cooldown_minutes(hours);
    }
    if job.scheduled_at.is_none() {
        return best_time_minutes(rng);
    }
    backoff.delay_minutes(job.attempts.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use zapflow_core::{FollowUpStatus, JsonPayload};

    fn job(scheduled_at: Option<i64>, attempts: u32, constraints: Option<&str>) -> FollowUp {
        FollowUp {
            id: "f1".into(),
            lead_id: "l1".into(),
            status: FollowUpStatus::Processing,
            scheduled_at,
            processing_at: Some(0),
            worker_id: Some("w1".into()),
            attempts,
            max_attempts: 3,
            last_error: None,
            objective: "reengage".into(),
            constraints: constraints.map(|c| JsonPayload::parse(c).unwrap()),
            cta: None,
            ab_test: false,
            template_id: None,
            idempotency_key: None,
            command_id: None,
            created_at: 0,
            sent_at: None,
            variant: None,
        }
    }

    #[test]
    fn test_best_time_window() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let m = best_time_minutes(&mut rng);
            assert!((15..=45).contains(&m), "out of window: {m}");
        }
    }

    #[test]
    fn test_cooldown_rounds_up() {
        assert_eq!(cooldown_minutes(1.0), 60);
        assert_eq!(cooldown_minutes(0.01), 1);
        assert_eq!(cooldown_minutes(2.5), 150);
        assert_eq!(cooldown_minutes(0.0), 0);
    }

    #[test]
    fn test_cooldown_takes_precedence() {
        let mut rng = StdRng::seed_from_u64(1);
        let backoff = BackoffPolicy::default();
        let j = job(None, 1, Some(r#"{"cooldownHours": 4}"#));
        assert_eq!(queued_delay_minutes(&j, &backoff, &mut rng), 240);
        let j = job(Some(0), 3, Some(r#"{"cooldownHours": 4}"#));
        assert_eq!(queued_delay_minutes(&j, &backoff, &mut rng), 240);
    }

    #[test]
    fn test_first_attempt_uses_best_time() {
        let mut rng = StdRng::seed_from_u64(2);
        let backoff = BackoffPolicy::default();
        let m = queued_delay_minutes(&job(None, 1, None), &backoff, &mut rng);
        assert!((15..=45).contains(&m));
    }

    #[test]
    fn test_scheduled_job_falls_back_to_backoff() {
        let mut rng = StdRng::seed_from_u64(3);
        let backoff = BackoffPolicy::default();
        assert_eq!(queued_delay_minutes(&job(Some(0), 1, None), &backoff, &mut rng), 15);
        assert_eq!(queued_delay_minutes(&job(Some(0), 2, None), &backoff, &mut rng), 30);
    }
}
