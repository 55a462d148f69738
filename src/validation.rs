//! Input validation for values that cross the agent boundary.

use crate::error::{HyphaError, Result};
use sha3::{Digest, Keccak256};

pub const MAX_AMOUNT: f64 = 1_000_000_000.0;
pub const MAX_TASK_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_DEADLINE_HOURS: u32 = 8_760;
pub const MIN_PASSPHRASE_LEN: usize = 8;
pub const MAX_PASSPHRASE_LEN: usize = 1_000;

/// Render 40 hex characters as an EIP-55 mixed-case address with `0x` prefix.
pub fn to_checksum_address(hex_address: &str) -> String {
    let lower = hex_address.trim_start_matches("0x").to_ascii_lowercase();
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Validate an EVM address and return it in checksummed form.
///
/// All-lowercase and all-uppercase addresses are accepted as unchecksummed input;
/// mixed-case input must carry a correct checksum.
pub fn validate_ethereum_address(address: &str, param_name: &str) -> Result<String> {
    let Some(body) = address.strip_prefix("0x") else {
        return Err(HyphaError::Validation(format!("{} must start with '0x'", param_name)));
    };

    if address.len() != 42 {
        return Err(HyphaError::Validation(format!(
            "{} must be 42 characters (0x + 40 hex), got {}",
            param_name,
            address.len()
        )));
    }

    if !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HyphaError::Validation(format!("{} contains invalid characters", param_name)));
    }

    let checksummed = to_checksum_address(body);
    let is_uniform = body == body.to_ascii_lowercase() || body == body.to_ascii_uppercase();
    if !is_uniform && checksummed != address {
        return Err(HyphaError::Validation(format!("{} has invalid checksum", param_name)));
    }

    Ok(checksummed)
}

pub fn validate_amount(amount: f64, param_name: &str) -> Result<f64> {
    if !amount.is_finite() {
        return Err(HyphaError::Validation(format!("{} must be a finite number", param_name)));
    }
    if amount <= 0.0 {
        return Err(HyphaError::Validation(format!("{} must be greater than 0", param_name)));
    }
    if amount > MAX_AMOUNT {
        return Err(HyphaError::Validation(format!(
            "{} exceeds maximum of {}",
            param_name, MAX_AMOUNT
        )));
    }
    Ok(amount)
}

/// Escrow ids are bytes32 values; returns the `0x`-prefixed lowercase form.
pub fn validate_escrow_id(escrow_id: &str, param_name: &str) -> Result<String> {
    let body = escrow_id.trim_start_matches("0x").trim_start_matches("0X");

    if body.len() != 64 {
        return Err(HyphaError::Validation(format!(
            "{} must be 64 hex characters (bytes32), got {}",
            param_name,
            body.len()
        )));
    }
    if !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HyphaError::Validation(format!("{} contains invalid characters", param_name)));
    }

    Ok(format!("0x{}", body.to_ascii_lowercase()))
}

pub fn validate_task_description<'a>(task: &'a str, param_name: &str) -> Result<&'a str> {
    if task.is_empty() {
        return Err(HyphaError::Validation(format!("{} cannot be empty", param_name)));
    }
    if task.chars().count() > MAX_TASK_DESCRIPTION_LEN {
        return Err(HyphaError::Validation(format!(
            "{} too long (max {} characters)",
            param_name, MAX_TASK_DESCRIPTION_LEN
        )));
    }
    Ok(task)
}

pub fn validate_deadline_hours(hours: u32, param_name: &str) -> Result<u32> {
    if hours == 0 {
        return Err(HyphaError::Validation(format!("{} must be greater than 0", param_name)));
    }
    if hours > MAX_DEADLINE_HOURS {
        return Err(HyphaError::Validation(format!(
            "{} exceeds maximum of {} hours (1 year)",
            param_name, MAX_DEADLINE_HOURS
        )));
    }
    Ok(hours)
}

pub fn validate_passphrase(passphrase: &str) -> Result<&str> {
    let len = passphrase.chars().count();
    if len < MIN_PASSPHRASE_LEN {
        return Err(HyphaError::Validation(format!(
            "Seed passphrase must be at least {} characters",
            MIN_PASSPHRASE_LEN
        )));
    }
    if len > MAX_PASSPHRASE_LEN {
        return Err(HyphaError::Validation(format!(
            "Seed passphrase too long (max {} characters)",
            MAX_PASSPHRASE_LEN
        )));
    }
    Ok(passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors from EIP-55.
    const CHECKSUMMED: [&str; 2] = [
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
        "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
    ];

    #[test]
    fn test_checksum_vectors() {
        for expected in CHECKSUMMED {
            assert_eq!(to_checksum_address(&expected.to_lowercase()), expected);
            assert_eq!(validate_ethereum_address(expected, "addr").unwrap(), expected);
        }
    }

    #[test]
    fn test_address_rejections() {
        assert!(validate_ethereum_address("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", "addr").is_err());
        assert!(validate_ethereum_address("0x1234", "addr").is_err());
        assert!(validate_ethereum_address("0xZZAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", "addr").is_err());
        // flipped case on one letter breaks the checksum
        assert!(validate_ethereum_address("0x5AAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", "addr").is_err());
        // uniform case is accepted and normalised
        let lower = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";
        assert_eq!(validate_ethereum_address(lower, "addr").unwrap(), CHECKSUMMED[0]);
    }

    #[test]
    fn test_amount_bounds() {
        assert_eq!(validate_amount(5.0, "amount").unwrap(), 5.0);
        assert!(validate_amount(0.0, "amount").is_err());
        assert!(validate_amount(-1.0, "amount").is_err());
        assert!(validate_amount(f64::NAN, "amount").is_err());
        assert!(validate_amount(MAX_AMOUNT + 1.0, "amount").is_err());
    }

    #[test]
    fn test_escrow_id() {
        let raw = "ab".repeat(32);
        assert_eq!(validate_escrow_id(&raw, "escrow_id").unwrap(), format!("0x{}", raw));
        assert_eq!(
            validate_escrow_id(&format!("0x{}", raw.to_uppercase()), "escrow_id").unwrap(),
            format!("0x{}", raw)
        );
        assert!(validate_escrow_id("0x1234", "escrow_id").is_err());
        assert!(validate_escrow_id(&"zz".repeat(32), "escrow_id").is_err());
    }

    #[test]
    fn test_task_and_deadline() {
        assert!(validate_task_description("review code", "task").is_ok());
        assert!(validate_task_description("", "task").is_err());
        assert!(validate_task_description(&"x".repeat(MAX_TASK_DESCRIPTION_LEN + 1), "task").is_err());
        assert!(validate_deadline_hours(24, "deadline_hours").is_ok());
        assert!(validate_deadline_hours(0, "deadline_hours").is_err());
        assert!(validate_deadline_hours(MAX_DEADLINE_HOURS + 1, "deadline_hours").is_err());
    }

    #[test]
    fn test_passphrase_bounds() {
        assert!(validate_passphrase("12345678").is_ok());
        assert!(validate_passphrase("1234567").is_err());
        assert!(validate_passphrase(&"p".repeat(MAX_PASSPHRASE_LEN + 1)).is_err());
    }
}
