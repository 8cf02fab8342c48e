use std::collections::BTreeSet;

use crate::error::SplitError;
use crate::money::Money;
use crate::types::{Participant, Split, SplitMode, UserId};

const BP_SCALE: u32 = 10_000;

/// Computes the per-debtor owed amounts for an expense.
///
/// The payer never appears in the output; whatever the non-payer shares do
/// not cover is the payer's own share. Remainder cents from integer division
/// go to the first participants in `user_id` ascending order, and a remainder
/// cent that would land on the payer simply stays with the payer.
pub fn compute_splits(
    amount: Money,
    mode: SplitMode,
    participants: &[Participant],
    payer: &UserId,
) -> Result<Vec<Split>, SplitError> {
    if !amount.is_positive() {
        return Err(SplitError::NonPositiveAmount);
    }
    if participants.is_empty() {
        return Err(SplitError::EmptyParticipants);
    }

    let mut seen = BTreeSet::new();
    for participant in participants {
        if !seen.insert(&participant.user_id) {
            return Err(SplitError::DuplicateParticipant(
                participant.user_id.to_string(),
            ));
        }
    }

    let mut ordered: Vec<&Participant> = participants.iter().collect();
    ordered.sort_by(|a, b| a.user_id.cmp(&b.user_id));

    match mode {
        SplitMode::Equal => equal_splits(amount, &ordered, payer),
        SplitMode::Exact => exact_splits(amount, &ordered, payer),
        SplitMode::Percentage => percentage_splits(amount, &ordered, payer),
    }
}

fn equal_splits(
    amount: Money,
    ordered: &[&Participant],
    payer: &UserId,
) -> Result<Vec<Split>, SplitError> {
    let n = ordered.len() as i64;
    let base = amount.cents() / n;
    let remainder = amount.cents() % n;

    let mut splits = Vec::new();
    for (index, participant) in ordered.iter().enumerate() {
        let share = base + i64::from((index as i64) < remainder);
        if participant.user_id != *payer && share > 0 {
            splits.push(Split {
                user_id: participant.user_id.clone(),
                amount: Money::from_cents(share),
            });
        }
    }
    Ok(splits)
}

fn exact_splits(
    amount: Money,
    ordered: &[&Participant],
    payer: &UserId,
) -> Result<Vec<Split>, SplitError> {
    let mut splits = Vec::new();
    let mut total = Money::ZERO;
    for participant in ordered {
        if participant.user_id == *payer {
            // The payer absorbs the residual; a payer-side exact amount is
            // not part of the owed total.
            continue;
        }
        let share = participant
            .exact_amount
            .ok_or_else(|| SplitError::MissingExactAmount(participant.user_id.to_string()))?;
        if !share.is_positive() {
            return Err(SplitError::NonPositiveShare(participant.user_id.to_string()));
        }
        total = total
            .checked_add(share)
            .ok_or(SplitError::ExceedsTotal { total, amount })?;
        splits.push(Split {
            user_id: participant.user_id.clone(),
            amount: share,
        });
    }
    if total > amount {
        return Err(SplitError::ExceedsTotal { total, amount });
    }
    Ok(splits)
}

fn percentage_splits(
    amount: Money,
    ordered: &[&Participant],
    payer: &UserId,
) -> Result<Vec<Split>, SplitError> {
    let mut total_bp: u64 = 0;
    let mut shares: Vec<(&UserId, u32, i64)> = Vec::with_capacity(ordered.len());
    for participant in ordered {
        let bp = match participant.percent_bp {
            Some(bp) => bp,
            // A payer listed without a percentage absorbs the residual.
            None if participant.user_id == *payer => 0,
            None => {
                return Err(SplitError::MissingPercent(participant.user_id.to_string()))
            }
        };
        if bp > BP_SCALE {
            return Err(SplitError::PercentOutOfRange(
                participant.user_id.to_string(),
            ));
        }
        total_bp += u64::from(bp);
        let share = (i128::from(amount.cents()) * i128::from(bp) / i128::from(BP_SCALE)) as i64;
        shares.push((&participant.user_id, bp, share));
    }
    if total_bp > u64::from(BP_SCALE) {
        return Err(SplitError::PercentTotalExceeded(total_bp));
    }

    // A full 100% allocation floors to slightly under the amount; hand the
    // leftover cents to the first percentage participants in id order. Under
    // 100% the payer absorbs the residual instead.
    if total_bp == u64::from(BP_SCALE) {
        let allocated: i64 = shares.iter().map(|(_, _, share)| share).sum();
        let mut leftover = amount.cents() - allocated;
        for (_, bp, share) in shares.iter_mut() {
            if leftover == 0 {
                break;
            }
            if *bp > 0 {
                *share += 1;
                leftover -= 1;
            }
        }
    }

    Ok(shares
        .into_iter()
        .filter(|(user_id, _, share)| *user_id != payer && *share > 0)
        .map(|(user_id, _, share)| Split {
            user_id: user_id.clone(),
            amount: Money::from_cents(share),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cents(v: i64) -> Money {
        Money::from_cents(v)
    }

    fn owed(splits: &[Split]) -> i64 {
        splits.iter().map(|s| s.amount.cents()).sum()
    }

    #[test]
    fn equal_split_excludes_payer_and_balances() {
        let participants = vec![
            Participant::equal("alice"),
            Participant::equal("bob"),
            Participant::equal("carol"),
        ];
        let splits = compute_splits(
            cents(9000),
            SplitMode::Equal,
            &participants,
            &UserId::new("alice"),
        )
        .unwrap();
        assert_eq!(splits.len(), 2);
        assert!(splits.iter().all(|s| s.amount == cents(3000)));
        assert!(splits.iter().all(|s| s.user_id != UserId::new("alice")));
    }

    #[test]
    fn equal_split_distributes_remainder_by_user_id() {
        // 100 / 3 = 33 with 1 cent over; "alice" sorts first and is the
        // payer, so the extra cent stays with the payer.
        let participants = vec![
            Participant::equal("carol"),
            Participant::equal("alice"),
            Participant::equal("bob"),
        ];
        let splits = compute_splits(
            cents(100),
            SplitMode::Equal,
            &participants,
            &UserId::new("alice"),
        )
        .unwrap();
        assert_eq!(owed(&splits), 66);
        assert!(splits.iter().all(|s| s.amount == cents(33)));

        // With "bob" paying, the cent lands on "alice" instead.
        let splits = compute_splits(
            cents(100),
            SplitMode::Equal,
            &participants,
            &UserId::new("bob"),
        )
        .unwrap();
        let alice = splits
            .iter()
            .find(|s| s.user_id == UserId::new("alice"))
            .unwrap();
        assert_eq!(alice.amount, cents(34));
        assert_eq!(owed(&splits), 67);
    }

    #[test]
    fn equal_split_drops_zero_shares() {
        let participants = vec![
            Participant::equal("a"),
            Participant::equal("b"),
            Participant::equal("c"),
        ];
        let splits =
            compute_splits(cents(1), SplitMode::Equal, &participants, &UserId::new("b")).unwrap();
        // Only "a" gets the single cent; "c" owes nothing and is omitted.
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].user_id, UserId::new("a"));
        assert_eq!(splits[0].amount, cents(1));
    }

    #[test]
    fn exact_split_requires_amounts_and_caps_total() {
        let participants = vec![
            Participant::exact("bob", cents(300)),
            Participant::exact("carol", cents(200)),
            Participant::equal("alice"),
        ];
        let splits = compute_splits(
            cents(1000),
            SplitMode::Exact,
            &participants,
            &UserId::new("alice"),
        )
        .unwrap();
        assert_eq!(owed(&splits), 500);

        let over = vec![
            Participant::exact("bob", cents(900)),
            Participant::exact("carol", cents(200)),
        ];
        let err = compute_splits(
            cents(1000),
            SplitMode::Exact,
            &over,
            &UserId::new("alice"),
        )
        .unwrap_err();
        assert!(matches!(err, SplitError::ExceedsTotal { .. }));

        let missing = vec![Participant::equal("bob")];
        let err = compute_splits(
            cents(1000),
            SplitMode::Exact,
            &missing,
            &UserId::new("alice"),
        )
        .unwrap_err();
        assert!(matches!(err, SplitError::MissingExactAmount(_)));
    }

    #[test]
    fn percentage_split_floors_and_redistributes_at_full_allocation() {
        // 3334 + 3333 + 3333 bp over 100.01: floors sum to 10000, the single
        // leftover cent goes to the first participant by user id.
        let participants = vec![
            Participant::percent("alice", 3334),
            Participant::percent("bob", 3333),
            Participant::percent("carol", 3333),
        ];
        let splits = compute_splits(
            cents(10001),
            SplitMode::Percentage,
            &participants,
            &UserId::new("carol"),
        )
        .unwrap();
        let alice = splits
            .iter()
            .find(|s| s.user_id == UserId::new("alice"))
            .unwrap();
        let bob = splits
            .iter()
            .find(|s| s.user_id == UserId::new("bob"))
            .unwrap();
        // alice: floor(10001*0.3334) = 3334, +1 leftover cent = 3335.
        assert_eq!(alice.amount, cents(3335));
        assert_eq!(bob.amount, cents(3333));
        // carol (payer) keeps the rest: 10001 - 3335 - 3333 = 3333.
        assert_eq!(owed(&splits), 6668);
    }

    #[test]
    fn percentage_split_payer_absorbs_residual_under_full_allocation() {
        let participants = vec![
            Participant::percent("bob", 2500),
            Participant::percent("carol", 2500),
        ];
        let splits = compute_splits(
            cents(1000),
            SplitMode::Percentage,
            &participants,
            &UserId::new("alice"),
        )
        .unwrap();
        // 50% allocated; the payer keeps the other 500 implicitly.
        assert_eq!(owed(&splits), 500);
    }

    #[test]
    fn percentage_split_validates_inputs() {
        let over = vec![
            Participant::percent("bob", 9000),
            Participant::percent("carol", 2000),
        ];
        let err = compute_splits(
            cents(1000),
            SplitMode::Percentage,
            &over,
            &UserId::new("alice"),
        )
        .unwrap_err();
        assert_eq!(err, SplitError::PercentTotalExceeded(11000));

        let out_of_range = vec![Participant::percent("bob", 10001)];
        let err = compute_splits(
            cents(1000),
            SplitMode::Percentage,
            &out_of_range,
            &UserId::new("alice"),
        )
        .unwrap_err();
        assert!(matches!(err, SplitError::PercentOutOfRange(_)));
    }

    #[test]
    fn rejects_empty_duplicate_and_non_positive() {
        assert_eq!(
            compute_splits(cents(100), SplitMode::Equal, &[], &UserId::new("a")),
            Err(SplitError::EmptyParticipants)
        );
        assert_eq!(
            compute_splits(
                cents(0),
                SplitMode::Equal,
                &[Participant::equal("a")],
                &UserId::new("a")
            ),
            Err(SplitError::NonPositiveAmount)
        );
        let dup = vec![Participant::equal("a"), Participant::equal("a")];
        assert!(matches!(
            compute_splits(cents(100), SplitMode::Equal, &dup, &UserId::new("a")),
            Err(SplitError::DuplicateParticipant(_))
        ));
    }
}
