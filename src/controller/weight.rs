//! Conversions between traffic weight percentages and replica counts
//!
//! Both directions round towards the canary: a nonzero weight never maps to
//! zero replicas and a nonzero replica count never maps to zero weight.

use thiserror::Error;

pub const HUNDRED: i32 = 100;

/// Precondition violations for weight/replica conversions
///
/// These indicate a caller bug or misconfiguration, never a transient failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WeightError {
    #[error("weight {0} must be between 0 and 100")]
    WeightOutOfRange(i32),

    #[error("replica total {0} must be non-negative")]
    NegativeTotal(i32),

    #[error("replica total must be greater than 0")]
    ZeroTotal,

    #[error("part {part} must be between 0 and total {total}")]
    PartOutOfRange { part: i32, total: i32 },
}

/// Replicas needed to carry `weight` percent of `total`
///
/// Returns `ceil(total * weight / 100)`.
///
/// # Examples
/// ```
/// use kanary::controller::weight::replicas_for_weight;
/// assert_eq!(replicas_for_weight(33, 3), Ok(1));
/// assert_eq!(replicas_for_weight(1, 3), Ok(1));
/// assert_eq!(replicas_for_weight(100, 3), Ok(3));
/// ```
pub fn replicas_for_weight(weight: i32, total: i32) -> Result<i32, WeightError> {
    if !(0..=HUNDRED).contains(&weight) {
        return Err(WeightError::WeightOutOfRange(weight));
    }
    if total < 0 {
        return Err(WeightError::NegativeTotal(total));
    }

    let scaled = i64::from(total) * i64::from(weight);
    let hundred = i64::from(HUNDRED);
    // bounded by total since weight <= 100
    Ok(((scaled + hundred - 1) / hundred) as i32)
}

/// Percentage of `total` represented by `part`
///
/// Rounds up so that any nonzero part reports a nonzero weight,
/// e.g. 1 of 3 is 34 and 2 of 3 is 67.
///
/// # Examples
/// ```
/// use kanary::controller::weight::weight_for_replicas;
/// assert_eq!(weight_for_replicas(1, 3), Ok(34));
/// assert_eq!(weight_for_replicas(1, 4), Ok(25));
/// assert_eq!(weight_for_replicas(3, 3), Ok(100));
/// ```
pub fn weight_for_replicas(part: i32, total: i32) -> Result<i32, WeightError> {
    if total < 0 {
        return Err(WeightError::NegativeTotal(total));
    }
    if total == 0 {
        return Err(WeightError::ZeroTotal);
    }
    if !(0..=total).contains(&part) {
        return Err(WeightError::PartOutOfRange { part, total });
    }

    let scaled = i64::from(part) * i64::from(HUNDRED);
    let total = i64::from(total);
    Ok(((scaled + total - 1) / total) as i32)
}
