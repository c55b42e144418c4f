// Sign-magnitude encoding for Feetech registers.
//
// Signed quantities (velocities, homing offsets) travel over the bus in
// unsigned registers where one designated bit carries the sign and the bits
// below it the absolute magnitude.

/// Magnitude does not fit below the sign bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value {value} does not fit in a register with sign bit {sign_bit}")]
pub struct ValueOutOfRangeError {
    pub value: i32,
    pub sign_bit: u32,
}

/// Pack a signed value into an unsigned register with the sign at bit
/// `sign_bit` and the magnitude below it.
///
/// A magnitude of `(1 << sign_bit) - 1` is the largest that fits; anything
/// larger would bleed into the sign bit and is rejected.
pub fn encode_sign_magnitude(value: i32, sign_bit: u32) -> Result<u32, ValueOutOfRangeError> {
    debug_assert!(sign_bit < 32);
    let magnitude = value.unsigned_abs();
    if magnitude > (1 << sign_bit) - 1 {
        return Err(ValueOutOfRangeError { value, sign_bit });
    }
    Ok(if value < 0 {
        magnitude | (1 << sign_bit)
    } else {
        magnitude
    })
}

/// Exact inverse of [`encode_sign_magnitude`].
pub fn decode_sign_magnitude(raw: u32, sign_bit: u32) -> i32 {
    debug_assert!(sign_bit < 32);
    let magnitude = (raw & ((1 << sign_bit) - 1)) as i32;
    if raw & (1 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}
