//! Daily credit replenishment.
//!
//! Top-ups are lazy: nothing runs on a timer. Each store evaluates
//! [`evaluate_top_up`] inside the same atomic step that reads the balance, so
//! the outcome is a pure function of `(now, last_refresh, credits, policy)`.

use serde::{Deserialize, Serialize};

use crate::store::UserCreditAccount;

pub const TOP_UP_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUpPolicy {
    pub increment: u64,
    pub cap: u64,
}

impl Default for TopUpPolicy {
    fn default() -> Self {
        Self {
            increment: 5,
            cap: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUpOutcome {
    pub awarded: u64,
    pub new_balance: u64,
    pub capped: bool,
}

/// Returns `None` while the account is inside its 24 hour window. A clock that
/// moved backwards counts as "not yet elapsed".
pub fn evaluate_top_up(
    now_ms: u64,
    last_refresh_ms: Option<u64>,
    credits: u64,
    policy: TopUpPolicy,
) -> Option<TopUpOutcome> {
    if let Some(last) = last_refresh_ms {
        if now_ms.saturating_sub(last) < TOP_UP_WINDOW_MS {
            return None;
        }
    }

    if credits >= policy.cap {
        return Some(TopUpOutcome {
            awarded: 0,
            new_balance: credits,
            capped: true,
        });
    }

    let awarded = policy.increment.min(policy.cap - credits);
    Some(TopUpOutcome {
        awarded,
        new_balance: credits + awarded,
        capped: awarded < policy.increment,
    })
}

/// Applies a top-up to an account already held inside a store transaction.
/// `last_credit_refresh_ms` moves to `now_ms` whenever the window elapsed,
/// even if nothing was awarded.
pub fn apply_top_up(
    account: &mut UserCreditAccount,
    now_ms: u64,
    policy: TopUpPolicy,
) -> Option<TopUpOutcome> {
    let outcome = evaluate_top_up(
        now_ms,
        account.last_credit_refresh_ms,
        account.credits,
        policy,
    )?;
    account.credits = outcome.new_balance;
    account.last_credit_refresh_ms = Some(now_ms);
    account.updated_at_ms = now_ms;
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: TopUpPolicy = TopUpPolicy {
        increment: 5,
        cap: 10,
    };

    #[test]
    fn awards_up_to_cap_and_marks_capped() {
        let outcome = evaluate_top_up(TOP_UP_WINDOW_MS, Some(0), 8, POLICY).expect("eligible");
        assert_eq!(
            outcome,
            TopUpOutcome {
                awarded: 2,
                new_balance: 10,
                capped: true,
            }
        );
    }

    #[test]
    fn awards_full_increment_below_cap() {
        let outcome = evaluate_top_up(TOP_UP_WINDOW_MS * 3, Some(0), 1, POLICY).expect("eligible");
        assert_eq!(outcome.awarded, 5);
        assert_eq!(outcome.new_balance, 6);
        assert!(!outcome.capped);
    }

    #[test]
    fn at_or_above_cap_awards_nothing() {
        let outcome = evaluate_top_up(TOP_UP_WINDOW_MS, Some(0), 12, POLICY).expect("eligible");
        assert_eq!(outcome.awarded, 0);
        assert_eq!(outcome.new_balance, 12);
        assert!(outcome.capped);
    }

    #[test]
    fn never_refreshed_account_is_eligible() {
        let outcome = evaluate_top_up(5, None, 0, POLICY).expect("eligible");
        assert_eq!(outcome.awarded, 5);
    }

    #[test]
    fn inside_window_or_clock_rollback_is_not_eligible() {
        assert!(evaluate_top_up(TOP_UP_WINDOW_MS - 1, Some(0), 0, POLICY).is_none());
        assert!(evaluate_top_up(10, Some(1_000), 0, POLICY).is_none());
    }

    #[test]
    fn apply_moves_refresh_time_even_without_award() {
        let mut account = UserCreditAccount::new("u1", 0);
        account.credits = 10;
        account.last_credit_refresh_ms = Some(0);

        let outcome = apply_top_up(&mut account, TOP_UP_WINDOW_MS + 7, POLICY).expect("eligible");
        assert_eq!(outcome.awarded, 0);
        assert_eq!(account.last_credit_refresh_ms, Some(TOP_UP_WINDOW_MS + 7));
        assert!(apply_top_up(&mut account, TOP_UP_WINDOW_MS + 8, POLICY).is_none());
    }
}
