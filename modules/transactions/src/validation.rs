//! Validation logic for transaction creation requests

use rust_decimal::Decimal;
use thiserror::Error;

use crate::contracts::CreateTransactionRequest;

/// Largest amount a NUMERIC(18,2) column stores
const MAX_AMOUNT: Decimal = Decimal::from_parts(2_808_348_671, 232_830_643, 0, false, 2); // 9999999999999999.99

/// Validation errors for transaction requests
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Amount must be greater than 0, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Amount supports at most 2 decimal places, got {0}")]
    TooManyDecimalPlaces(Decimal),

    #[error("Amount exceeds the maximum of 9999999999999999.99, got {0}")]
    AmountTooLarge(Decimal),
}

/// Validate a transaction creation request
///
/// # Validation Rules
///
/// - `amount`: must be > 0
/// - `amount`: at most 2 decimal places (trailing zeros ignored)
/// - `amount`: must fit NUMERIC(18,2)
pub fn validate_create_transaction(req: &CreateTransactionRequest) -> Result<(), ValidationError> {
    let amount = req.amount;

    if amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount(amount));
    }

    if amount.normalize().scale() > 2 {
        return Err(ValidationError::TooManyDecimalPlaces(amount));
    }

    if amount > MAX_AMOUNT {
        return Err(ValidationError::AmountTooLarge(amount));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn request(amount: &str) -> CreateTransactionRequest {
        CreateTransactionRequest {
            from_account_id: 1,
            to_account_id: 2,
            amount: Decimal::from_str(amount).unwrap(),
        }
    }

    #[test]
    fn test_max_amount_constant() {
        assert_eq!(MAX_AMOUNT, Decimal::from_str("9999999999999999.99").unwrap());
    }

    #[test]
    fn test_valid_amounts() {
        assert!(validate_create_transaction(&request("10.00")).is_ok());
        assert!(validate_create_transaction(&request("0.01")).is_ok());
        assert!(validate_create_transaction(&request("12.500")).is_ok());
        assert!(validate_create_transaction(&request("9999999999999999.99")).is_ok());
    }

    #[test]
    fn test_non_positive_amounts() {
        assert!(matches!(
            validate_create_transaction(&request("0")),
            Err(ValidationError::NonPositiveAmount(_))
        ));
        assert!(matches!(
            validate_create_transaction(&request("-5.00")),
            Err(ValidationError::NonPositiveAmount(_))
        ));
    }

    #[test]
    fn test_precision_and_range() {
        assert!(matches!(
            validate_create_transaction(&request("1.005")),
            Err(ValidationError::TooManyDecimalPlaces(_))
        ));
        assert!(matches!(
            validate_create_transaction(&request("10000000000000000")),
            Err(ValidationError::AmountTooLarge(_))
        ));
    }
}
