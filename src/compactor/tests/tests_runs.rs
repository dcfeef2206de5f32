//! Run scoring and best-run selection tests.
//!
//! These pin the selection heuristic exactly: the literal candidate list
//! below (five blocks of scores) must select the fourth block, and the
//! corner-case run scores are asserted to the digit.

#[cfg(test)]
mod tests {
    use crate::compactor::{score_run, select_best_run};

    const MAX_RUN: usize = 4;
    const SINGLE: f64 = 60.0;
    const MAX_TARGET: f64 = 80.0;

    /// # Scenario
    /// Best-run selection over 18 candidates in five natural blocks:
    /// `[75,85,62,70] [58,95,95,65] [90,100,100,100] [75,76,76,60] [80,80]`.
    ///
    /// # Expected behavior
    /// The fourth block wins: indices 12..16, run score
    /// `80 − (75+76+76+60)/4 = 8.25`.
    #[test]
    fn literal_candidate_list_selects_block_four() {
        let scores = [
            75.0, 85.0, 62.0, 70.0, 58.0, 95.0, 95.0, 65.0, 90.0, 100.0, 100.0, 100.0, 75.0,
            76.0, 76.0, 60.0, 80.0, 80.0,
        ];
        let (best, best_score) = select_best_run(&scores, MAX_RUN, SINGLE, MAX_TARGET);
        assert_eq!(best, 12..16);
        assert!((best_score - 8.25).abs() < 1e-9);
    }

    /// # Scenario
    /// Run-scoring corners: the empty run is 0.0; a single file at 75
    /// scores 60 − 75 = −15; a single file at 100 scores −40.
    #[test]
    fn run_score_corners() {
        assert_eq!(score_run(&[], MAX_RUN, SINGLE, MAX_TARGET), 0.0);
        assert_eq!(score_run(&[75.0], MAX_RUN, SINGLE, MAX_TARGET), -15.0);
        assert_eq!(score_run(&[100.0], MAX_RUN, SINGLE, MAX_TARGET), -40.0);
    }

    /// The length-adjusted target interpolates 60 → 80 across run lengths
    /// 1..=4.
    #[test]
    fn run_target_interpolates_with_length() {
        assert_eq!(score_run(&[0.0], MAX_RUN, SINGLE, MAX_TARGET), 60.0);
        let t2 = score_run(&[0.0, 0.0], MAX_RUN, SINGLE, MAX_TARGET);
        assert!((t2 - (60.0 + 20.0 / 3.0)).abs() < 1e-9);
        let t3 = score_run(&[0.0, 0.0, 0.0], MAX_RUN, SINGLE, MAX_TARGET);
        assert!((t3 - (60.0 + 40.0 / 3.0)).abs() < 1e-9);
        assert_eq!(score_run(&[0.0; 4], MAX_RUN, SINGLE, MAX_TARGET), 80.0);
    }

    /// # Scenario
    /// All candidates fully active (high scores): no run beats the empty
    /// run, so selection returns the empty range and the compactor does
    /// nothing.
    #[test]
    fn fully_active_candidates_select_nothing() {
        let scores = [90.0, 95.0, 100.0, 100.0];
        let (best, best_score) = select_best_run(&scores, MAX_RUN, SINGLE, MAX_TARGET);
        assert!(best.is_empty());
        assert_eq!(best_score, 0.0);
    }

    /// # Scenario
    /// Backtracking: a mediocre prefix is shed when a later candidate
    /// scores better alone. `[85, 40]`: extending to `[85,40]` scores
    /// 66.67 − 62.5 ≈ 4.17, restarting at `[40]` scores 20 — restart wins.
    #[test]
    fn restart_sheds_a_mediocre_prefix() {
        let (best, best_score) = select_best_run(&[85.0, 40.0], MAX_RUN, SINGLE, MAX_TARGET);
        assert_eq!(best, 1..2);
        assert_eq!(best_score, 20.0);
    }

    /// # Scenario
    /// A full-length run forces a restart: with `max_run = 2` the third
    /// candidate starts a new run rather than growing the first.
    #[test]
    fn full_run_forces_restart() {
        // With max_run = 2, [50,50] scores 80 − 50 = 30 and fills the run;
        // [20] alone scores 40 and is only reachable through the forced
        // restart after it.
        let (best, best_score) = select_best_run(&[50.0, 50.0, 20.0], 2, SINGLE, MAX_TARGET);
        assert_eq!(best, 2..3);
        assert_eq!(best_score, 40.0);
    }

    /// Longer runs of equal quality beat shorter ones while the target
    /// climbs faster than the mean.
    #[test]
    fn equal_scores_prefer_longer_runs() {
        let scores = [50.0, 50.0, 50.0, 50.0];
        let (best, best_score) = select_best_run(&scores, MAX_RUN, SINGLE, MAX_TARGET);
        assert_eq!(best, 0..4);
        assert_eq!(best_score, 30.0);
    }
}
