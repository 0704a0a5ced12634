//! Consecutive win tracking and milestone gating

use crate::state::EngineState;

/// 3, 5, 7, 10, then every multiple of 5 from 15
pub fn is_milestone(streak: u32) -> bool {
    matches!(streak, 3 | 5 | 7 | 10) || (streak >= 15 && streak % 5 == 0)
}

/// Count a win or recovery. A zero streak is restored from `backfill` (resolved
/// history that already includes this win) when available.
///
/// Returns the milestone to celebrate, at most once per value.
pub fn record_win(state: &mut EngineState, backfill: Option<u32>) -> Option<u32> {
    state.streak = match (state.streak, backfill) {
        (0, Some(restored)) => restored.max(1),
        (current, _) => current + 1,
    };

    let streak = state.streak;
    if is_milestone(streak) && streak > state.last_celebrated {
        state.last_celebrated = streak;
        Some(streak)
    } else {
        None
    }
}

pub fn record_loss(state: &mut EngineState) {
    state.streak = 0;
    state.last_celebrated = 0;
}

/// Leading wins in statuses ordered newest first
pub fn leading_wins<'a, I>(statuses: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    let count = statuses
        .into_iter()
        .take_while(|status| *status == persistence::repository::STATUS_WON)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestones() {
        let hits: Vec<u32> = (1..=30).filter(|n| is_milestone(*n)).collect();
        assert_eq!(hits, vec![3, 5, 7, 10, 15, 20, 25, 30]);
    }

    #[test]
    fn test_five_wins_celebrate_five_once() {
        let mut state = EngineState::default();
        let celebrated: Vec<Option<u32>> = (0..6).map(|_| record_win(&mut state, None)).collect();
        assert_eq!(
            celebrated,
            vec![None, None, Some(3), None, Some(5), None]
        );
        assert_eq!(state.streak, 6);
        assert_eq!(state.last_celebrated, 5);
    }

    #[test]
    fn test_loss_resets_and_allows_celebrating_again() {
        let mut state = EngineState::default();
        for _ in 0..3 {
            record_win(&mut state, None);
        }
        record_loss(&mut state);
        assert_eq!((state.streak, state.last_celebrated), (0, 0));

        record_win(&mut state, None);
        record_win(&mut state, None);
        assert_eq!(record_win(&mut state, None), Some(3));
    }

    #[test]
    fn test_zero_streak_restored_from_history() {
        let mut state = EngineState {
            last_celebrated: 3,
            ..EngineState::default()
        };
        // History already contains this win
        assert_eq!(record_win(&mut state, Some(5)), Some(5));
        assert_eq!(state.streak, 5);

        // No duplicate celebration of a value already announced
        let mut state = EngineState {
            last_celebrated: 5,
            ..EngineState::default()
        };
        assert_eq!(record_win(&mut state, Some(5)), None);
    }

    #[test]
    fn test_leading_wins_stops_at_first_loss() {
        assert_eq!(leading_wins(["won", "won", "lost", "won"]), 2);
        assert_eq!(leading_wins(["lost", "won"]), 0);
        assert_eq!(leading_wins(Vec::<&str>::new()), 0);
    }
}
