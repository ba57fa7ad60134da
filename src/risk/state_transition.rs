//! Which updates an undercollateralized account may still take.

use num_traits::Zero;

use super::margin::Risk;
use crate::types::UpdateResult;

/// Decide whether moving from `cur` to `new` is allowed, given that `new`
/// does not meet its initial requirement.
///
/// The transition is allowed when the account ends up no riskier: the
/// maintenance requirement does not grow and the collateral-to-requirement
/// ratio does not shrink (`newNC / newMMR >= curNC / curMMR`, compared by
/// cross-multiplication). When either requirement is zero, only a strict
/// increase of net collateral with both requirements zero is allowed.
///
/// A rejected transition is `NewlyUndercollateralized` when `cur` met its
/// initial requirement, `StillUndercollateralized` otherwise.
pub fn undercollateralized_transition(cur: &Risk, new: &Risk) -> UpdateResult {
    let rejected = if cur.is_initial_collateralized() {
        UpdateResult::NewlyUndercollateralized
    } else {
        UpdateResult::StillUndercollateralized
    };

    if new.mmr > cur.mmr {
        return rejected;
    }

    if new.mmr.is_zero() || cur.mmr.is_zero() {
        if new.mmr.is_zero() && cur.mmr.is_zero() && new.nc > cur.nc {
            return UpdateResult::Success;
        }
        return rejected;
    }

    if &cur.nc * &new.mmr > &new.nc * &cur.mmr {
        return rejected;
    }

    UpdateResult::Success
}

/// Full per-update verdict: anything meeting its initial requirement after the
/// update succeeds, everything else goes through the transition rule.
pub fn update_result(cur: &Risk, new: &Risk) -> UpdateResult {
    if new.is_initial_collateralized() {
        UpdateResult::Success
    } else {
        undercollateralized_transition(cur, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collateralized_after_update_is_success() {
        let cur = Risk::new(-100, 50, 30);
        let new = Risk::new(60, 50, 30);
        assert_eq!(update_result(&cur, &new), UpdateResult::Success);
    }

    #[test]
    fn test_newly_undercollateralized() {
        let cur = Risk::new(100, 50, 30);
        let new = Risk::new(40, 50, 30);
        // Ratio shrinks: 40/30 < 100/30.
        assert_eq!(update_result(&cur, &new), UpdateResult::NewlyUndercollateralized);
    }

    #[test]
    fn test_still_undercollateralized_when_requirement_grows() {
        let cur = Risk::new(10, 50, 30);
        let new = Risk::new(1_000, 2_000, 31);
        assert_eq!(update_result(&cur, &new), UpdateResult::StillUndercollateralized);
    }

    #[test]
    fn test_zero_requirements_need_strict_collateral_increase() {
        let cur = Risk::new(-100, 0, 0);
        assert_eq!(
            update_result(&cur, &Risk::new(-50, 0, 0)),
            UpdateResult::Success
        );
        assert_eq!(
            update_result(&cur, &Risk::new(-100, 0, 0)),
            UpdateResult::StillUndercollateralized
        );
        assert_eq!(
            update_result(&cur, &Risk::new(-150, 0, 0)),
            UpdateResult::StillUndercollateralized
        );
    }

    #[test]
    fn test_requirement_dropping_to_zero_is_rejected() {
        let cur = Risk::new(-100, 50, 30);
        let new = Risk::new(-20, 0, 0);
        assert_eq!(
            undercollateralized_transition(&cur, &new),
            UpdateResult::StillUndercollateralized
        );
    }

    #[test]
    fn test_improving_ratio_is_allowed() {
        // 20/10 = 2 vs 30/20 = 1.5: better.
        let cur = Risk::new(30, 40, 20);
        let new = Risk::new(20, 25, 10);
        assert_eq!(update_result(&cur, &new), UpdateResult::Success);

        // Equal ratio is allowed too.
        let new = Risk::new(15, 25, 10);
        assert_eq!(update_result(&cur, &new), UpdateResult::Success);
    }

    #[test]
    fn test_negative_collateral_ratio() {
        // -10/10 = -1 vs -30/20 = -1.5: better.
        let cur = Risk::new(-30, 40, 20);
        let new = Risk::new(-10, 25, 10);
        assert_eq!(update_result(&cur, &new), UpdateResult::Success);

        // -20/10 = -2: worse.
        let new = Risk::new(-20, 25, 10);
        assert_eq!(update_result(&cur, &new), UpdateResult::StillUndercollateralized);
    }
}
