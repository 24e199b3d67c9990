use crate::models::OrderNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OrderNumberError {
    #[error("order number must not be empty")]
    EmptyInput,
    #[error("order number must consist of digits only")]
    NonNumeric,
    #[error("order number failed the Luhn checksum")]
    ChecksumFailed,
}

/// Parse and checksum an order identifier.
pub fn validate(raw: &str) -> Result<OrderNumber, OrderNumberError> {
    if raw.is_empty() {
        return Err(OrderNumberError::EmptyInput);
    }

    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OrderNumberError::NonNumeric);
    }

    // Overflowing i64 counts as non-numeric as well
    let value: i64 = raw.parse().map_err(|_| OrderNumberError::NonNumeric)?;

    if !luhn_valid(raw) {
        return Err(OrderNumberError::ChecksumFailed);
    }

    Ok(OrderNumber::new_unchecked(value))
}

/// Mod-10 check over an all-digit string, doubling every second digit from the right.
fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let digit = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                digit
            }
        })
        .sum();

    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_luhn_valid_number() {
        assert_eq!(validate("12345678903").unwrap().get(), 12345678903);
        assert_eq!(validate("79927398713").unwrap().get(), 79927398713);
        assert_eq!(validate("0").unwrap().get(), 0);
    }

    #[test]
    fn test_rejects_bad_checksum() {
        assert_eq!(validate("12345678901"), Err(OrderNumberError::ChecksumFailed));
        assert_eq!(validate("79927398710"), Err(OrderNumberError::ChecksumFailed));
    }

    #[test]
    fn test_rejects_empty_input() {
        assert_eq!(validate(""), Err(OrderNumberError::EmptyInput));
    }

    #[test]
    fn test_rejects_non_digits() {
        assert_eq!(validate("12a45"), Err(OrderNumberError::NonNumeric));
        assert_eq!(validate("-12345678903"), Err(OrderNumberError::NonNumeric));
        assert_eq!(validate(" 12345678903"), Err(OrderNumberError::NonNumeric));
    }

    #[test]
    fn test_rejects_numbers_wider_than_i64() {
        assert_eq!(validate("99999999999999999999"), Err(OrderNumberError::NonNumeric));
    }
}
