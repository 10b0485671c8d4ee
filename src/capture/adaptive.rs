// Adaptive frame-rate controller
//
// Decides when capture can drop to a low frame rate without losing anything
// worth keeping. Input idleness alone is not enough: a video playing
// unattended still deserves full rate. The controller therefore requires two
// signals before downshifting: no user input for the configured threshold AND
// two visually-identical frame signatures sampled half a second apart.
// Any user input restores full rate immediately.

use std::time::{Duration, Instant};

use crate::capture::source::FrameSignature;

/// Minimum spacing between the two confirmation probes
const PROBE_SPACING: Duration = Duration::from_millis(500);

/// Minimum time between rate downshifts, so a screen flickering around the
/// staticness threshold does not thrash the encoder
const DOWNSHIFT_COOLDOWN: Duration = Duration::from_secs(10);

/// Mean-abs-diff below which two signatures count as the same image
const STATIC_THRESHOLD: f64 = 2.0;

/// Target rate the controller asks the session to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTarget {
    Full,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivityState {
    /// User recently active, full rate
    Active,
    /// Input idle long enough, waiting for visual confirmation
    PendingIdle,
    /// Confirmed static, reduced rate
    Idle,
}

pub struct AdaptiveController {
    state: ActivityState,
    idle_threshold: Duration,
    /// First probe of the current confirmation attempt
    pending_probe: Option<(Instant, FrameSignature)>,
    last_downshift: Option<Instant>,
}

impl AdaptiveController {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            state: ActivityState::Active,
            idle_threshold,
            pending_probe: None,
            last_downshift: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ActivityState::Idle
    }

    /// Feed the controller one observation. `idle_for` is the time since the
    /// last user input; `signature` is the latest staticness probe if one is
    /// available. Returns a target only when the rate should change.
    pub fn tick(
        &mut self,
        now: Instant,
        idle_for: Duration,
        signature: Option<FrameSignature>,
    ) -> Option<RateTarget> {
        if idle_for < self.idle_threshold {
            // User is back; full rate applies immediately, no cooldown
            self.pending_probe = None;
            if self.state != ActivityState::Active {
                self.state = ActivityState::Active;
                return Some(RateTarget::Full);
            }
            return None;
        }

        match self.state {
            ActivityState::Active => {
                self.state = ActivityState::PendingIdle;
                self.pending_probe = signature.map(|s| (now, s));
                None
            }
            ActivityState::PendingIdle => {
                let Some(current) = signature else {
                    return None;
                };
                match self.pending_probe.take() {
                    Some((probe_at, earlier)) if now.duration_since(probe_at) >= PROBE_SPACING => {
                        if earlier.mean_abs_diff(&current) < STATIC_THRESHOLD
                            && self.cooldown_elapsed(now)
                        {
                            self.state = ActivityState::Idle;
                            self.last_downshift = Some(now);
                            self.pending_probe = None;
                            Some(RateTarget::Idle)
                        } else {
                            // Screen still moving (or cooling down); restart
                            // the confirmation from this probe
                            self.pending_probe = Some((now, current));
                            None
                        }
                    }
                    Some(probe) => {
                        // Too soon to compare, keep the first probe
                        self.pending_probe = Some(probe);
                        None
                    }
                    None => {
                        self.pending_probe = Some((now, current));
                        None
                    }
                }
            }
            ActivityState::Idle => None,
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.last_downshift {
            Some(at) => now.duration_since(at) >= DOWNSHIFT_COOLDOWN,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(120);

    fn sig(value: u8) -> FrameSignature {
        FrameSignature::new(vec![value; 1024])
    }

    #[test]
    fn stays_full_rate_while_user_is_active() {
        let mut ctl = AdaptiveController::new(THRESHOLD);
        let now = Instant::now();
        assert_eq!(ctl.tick(now, Duration::from_secs(5), Some(sig(10))), None);
        assert!(!ctl.is_idle());
    }

    #[test]
    fn downshifts_after_two_matching_probes() {
        let mut ctl = AdaptiveController::new(THRESHOLD);
        let t0 = Instant::now();
        let idle = Duration::from_secs(200);

        // Enters PendingIdle with the first probe
        assert_eq!(ctl.tick(t0, idle, Some(sig(50))), None);
        // Second matching probe after the spacing window confirms
        let t1 = t0 + Duration::from_millis(600);
        assert_eq!(ctl.tick(t1, idle, Some(sig(50))), Some(RateTarget::Idle));
        assert!(ctl.is_idle());
    }

    #[test]
    fn unattended_video_keeps_full_rate() {
        let mut ctl = AdaptiveController::new(THRESHOLD);
        let mut now = Instant::now();
        let idle = Duration::from_secs(200);

        ctl.tick(now, idle, Some(sig(0)));
        // Every probe differs from the last, as with playing video
        for value in 1..20u8 {
            now += Duration::from_millis(600);
            assert_eq!(ctl.tick(now, idle, Some(sig(value * 12))), None);
        }
        assert!(!ctl.is_idle());
    }

    #[test]
    fn input_restores_full_rate_immediately() {
        let mut ctl = AdaptiveController::new(THRESHOLD);
        let t0 = Instant::now();
        let idle = Duration::from_secs(200);

        ctl.tick(t0, idle, Some(sig(50)));
        ctl.tick(t0 + Duration::from_millis(600), idle, Some(sig(50)));
        assert!(ctl.is_idle());

        // A keypress ends idleness with no cooldown applied
        let back = ctl.tick(
            t0 + Duration::from_secs(30),
            Duration::from_millis(10),
            None,
        );
        assert_eq!(back, Some(RateTarget::Full));
        assert!(!ctl.is_idle());
    }

    #[test]
    fn probes_closer_than_spacing_are_not_compared() {
        let mut ctl = AdaptiveController::new(THRESHOLD);
        let t0 = Instant::now();
        let idle = Duration::from_secs(200);

        ctl.tick(t0, idle, Some(sig(50)));
        // 100 ms later, identical image, still too soon to confirm
        assert_eq!(
            ctl.tick(t0 + Duration::from_millis(100), idle, Some(sig(50))),
            None
        );
    }

    #[test]
    fn downshift_cooldown_prevents_thrash() {
        let mut ctl = AdaptiveController::new(THRESHOLD);
        let t0 = Instant::now();
        let idle = Duration::from_secs(200);

        ctl.tick(t0, idle, Some(sig(50)));
        ctl.tick(t0 + Duration::from_millis(600), idle, Some(sig(50)));
        assert!(ctl.is_idle());

        // Brief activity, then idle again right away
        ctl.tick(t0 + Duration::from_secs(1), Duration::ZERO, None);
        let t2 = t0 + Duration::from_secs(2);
        ctl.tick(t2, idle, Some(sig(50)));
        // Matching probes, but the cooldown since the last downshift blocks it
        assert_eq!(
            ctl.tick(t2 + Duration::from_millis(600), idle, Some(sig(50))),
            None
        );
        assert!(!ctl.is_idle());
    }
}
