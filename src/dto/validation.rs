//! Validation helpers for DTOs.

use validator::ValidationError;

/// Shortest join code accepted on the wire.
pub const MIN_ROOM_CODE_LENGTH: usize = 4;
/// Longest join code accepted on the wire.
pub const MAX_ROOM_CODE_LENGTH: usize = 8;

/// Validates that a room code is made of 4 to 8 ASCII digits.
///
/// The exact length is checked against the configuration by the room service.
///
/// # Examples
///
/// ```ignore
/// validate_room_code("4821")  // Ok
/// validate_room_code("48a1")  // Err - not a digit
/// validate_room_code("482")   // Err - too short
/// ```
pub fn validate_room_code(code: &str) -> Result<(), ValidationError> {
    if !(MIN_ROOM_CODE_LENGTH..=MAX_ROOM_CODE_LENGTH).contains(&code.len()) {
        let mut err = ValidationError::new("room_code_length");
        err.message = Some(
            format!(
                "Room code must be {MIN_ROOM_CODE_LENGTH} to {MAX_ROOM_CODE_LENGTH} digits (got {})",
                code.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !code.chars().all(|c| c.is_ascii_digit()) {
        let mut err = ValidationError::new("room_code_format");
        err.message = Some("Room code must contain only digits".into());
        return Err(err);
    }

    Ok(())
}
