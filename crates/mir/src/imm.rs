//! Immediate encodability checks for 32-bit Thumb-2 instructions.

/// Whether `v` can be encoded as a Thumb-2 modified constant (the immediate
/// form accepted by `mov`, `add`, and friends in their 32-bit encodings).
///
/// The encodable forms are an 8-bit value, the byte splats `0x00XY00XY`,
/// `0xXY00XY00` and `0xXYXYXYXY`, and an 8-bit value with its top bit set
/// rotated right by 8 to 31 bits.
pub fn is_t2_so_imm(v: u32) -> bool {
    if v & 0xffff_ff00 == 0 {
        return true;
    }

    let byte = v & 0xff;
    if v == byte * 0x0001_0001 || v == byte * 0x0101_0101 {
        return true;
    }
    // The 0xXY00XY00 form carries its byte in bits 8..16.
    if v == ((v >> 8) & 0xff) * 0x0100_0100 {
        return true;
    }

    // Rotated form: all significant bits must fit in the 8-bit window
    // anchored at the highest set bit.
    let hi = 31 - v.leading_zeros();
    hi >= 7 && v & !(0xff << (hi - 7)) == 0
}
