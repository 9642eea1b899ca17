use crate::{
    error::{
        EngineError,
        ValidationError,
    },
    session::Amount,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::ops::RangeInclusive;
use thiserror::Error;

pub const DIE_FACES: RangeInclusive<u8> = 1..=6;

/// A winning bet pays back this many times the stake.
pub const PAYOUT_MULTIPLIER: Amount = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayoutError {
    #[error("roll {0} is not a die face (1..=6)")]
    InvalidRoll(u8),
    #[error("chosen number {0} is not a die face (1..=6)")]
    InvalidChoice(u8),
    #[error("payout for a bet of {bet_amount} overflows")]
    Overflow { bet_amount: Amount },
}

pub fn is_die_face(value: u8) -> bool {
    DIE_FACES.contains(&value)
}

pub fn payout(
    chosen_number: u8,
    result_roll: u8,
    bet_amount: Amount,
) -> Result<Amount, PayoutError> {
    if !is_die_face(result_roll) {
        return Err(PayoutError::InvalidRoll(result_roll));
    }
    if !is_die_face(chosen_number) {
        return Err(PayoutError::InvalidChoice(chosen_number));
    }
    if chosen_number != result_roll {
        return Ok(0);
    }
    bet_amount
        .checked_mul(PAYOUT_MULTIPLIER)
        .ok_or(PayoutError::Overflow { bet_amount })
}

/// Limits read from the contract at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRules {
    pub min_bet: Amount,
    pub max_bet: Amount,
    pub payout_multiplier: Amount,
}

impl GameRules {
    pub fn check(&self) -> Result<(), EngineError> {
        if self.payout_multiplier != PAYOUT_MULTIPLIER {
            return Err(EngineError::RulesMismatch {
                reported: self.payout_multiplier,
                expected: PAYOUT_MULTIPLIER,
            });
        }
        if self.min_bet > self.max_bet {
            return Err(EngineError::InvalidRules {
                min_bet: self.min_bet,
                max_bet: self.max_bet,
            });
        }
        Ok(())
    }

    pub fn validate_bet(
        &self,
        chosen_number: u8,
        bet_amount: Amount,
    ) -> Result<(), ValidationError> {
        if !is_die_face(chosen_number) {
            return Err(ValidationError::NumberOutOfRange(chosen_number));
        }
        if bet_amount == 0 {
            return Err(ValidationError::ZeroAmount);
        }
        if bet_amount < self.min_bet {
            return Err(ValidationError::BelowMinimum {
                amount: bet_amount,
                min: self.min_bet,
            });
        }
        if bet_amount > self.max_bet {
            return Err(ValidationError::AboveMaximum {
                amount: bet_amount,
                max: self.max_bet,
            });
        }
        Ok(())
    }
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            min_bet: 1,
            max_bet: 1_000_000_000_000_000_000,
            payout_multiplier: PAYOUT_MULTIPLIER,
        }
    }
}
