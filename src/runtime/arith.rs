// This module implements the arithmetic, comparison and conversion helpers with exact JVM
// semantics. Each helper is an `extern "C"` function with the platform calling convention so
// generated code can call it directly through its address; the compiler also calls the same
// functions to fold operations whose operands are compile-time constants, which guarantees
// that folded and run-time results agree bit for bit. Binary helpers take the JVM opcode as
// the selector. Integer division wraps (MIN / -1 == MIN, MIN % -1 == 0); a zero divisor
// yields 0 because generated code checks for it before the call. Shift counts are masked to
// 5 (int) or 6 (long) bits. Float remainder propagates NaN (dividend first) and returns the
// dividend when the divisor is infinite. fcmpg/dcmpg answer 1 and fcmpl/dcmpl answer -1 when
// either operand is NaN. Float-to-integer narrowing maps NaN to 0 and saturates at the
// target range. None of the helpers allocate, panic or trigger garbage collection.

//! JVM arithmetic, comparison and conversion runtime helpers.

use crate::core::bytecode::*;
use crate::core::jtype::JType;

/// Integer arithmetic selected by `op` (`IADD`..`IXOR`, `INEG` ignores `v2`).
pub extern "C" fn rt_h_i32_a(v1: i32, v2: i32, op: u32) -> i32 {
    match op as u8 {
        IADD => v1.wrapping_add(v2),
        ISUB => v1.wrapping_sub(v2),
        IMUL => v1.wrapping_mul(v2),
        IDIV => {
            if v2 == 0 {
                0
            } else {
                v1.wrapping_div(v2)
            }
        }
        IREM => {
            if v2 == 0 {
                0
            } else {
                v1.wrapping_rem(v2)
            }
        }
        INEG => v1.wrapping_neg(),
        ISHL => v1.wrapping_shl(v2 as u32 & 0x1f),
        ISHR => v1 >> (v2 & 0x1f),
        IUSHR => ((v1 as u32) >> (v2 & 0x1f)) as i32,
        IAND => v1 & v2,
        IOR => v1 | v2,
        IXOR => v1 ^ v2,
        _ => 0,
    }
}

/// Long arithmetic selected by `op` (`LADD`..`LXOR` without the shifts).
pub extern "C" fn rt_h_i64_a(v1: i64, v2: i64, op: u32) -> i64 {
    match op as u8 {
        LADD => v1.wrapping_add(v2),
        LSUB => v1.wrapping_sub(v2),
        LMUL => v1.wrapping_mul(v2),
        LDIV => {
            if v2 == 0 {
                0
            } else {
                v1.wrapping_div(v2)
            }
        }
        LREM => {
            if v2 == 0 {
                0
            } else {
                v1.wrapping_rem(v2)
            }
        }
        LNEG => v1.wrapping_neg(),
        LAND => v1 & v2,
        LOR => v1 | v2,
        LXOR => v1 ^ v2,
        _ => 0,
    }
}

/// Long shifts; the count is an int masked to six bits.
pub extern "C" fn rt_h_i64_shift(v: i64, n: i32, op: u32) -> i64 {
    let n = (n & 0x3f) as u32;
    match op as u8 {
        LSHL => v.wrapping_shl(n),
        LSHR => v >> n,
        LUSHR => ((v as u64) >> n) as i64,
        _ => 0,
    }
}

pub extern "C" fn rt_h_flt_a(v1: f32, v2: f32, op: u32) -> f32 {
    match op as u8 {
        FADD => v1 + v2,
        FSUB => v1 - v2,
        FMUL => v1 * v2,
        FDIV => v1 / v2,
        FREM => {
            if v1.is_nan() {
                v1
            } else if v2.is_nan() {
                v2
            } else if v1.is_finite() && v2.is_infinite() {
                v1
            } else {
                v1 % v2
            }
        }
        FNEG => -v1,
        _ => 0.0,
    }
}

pub extern "C" fn rt_h_dbl_a(v1: f64, v2: f64, op: u32) -> f64 {
    match op as u8 {
        DADD => v1 + v2,
        DSUB => v1 - v2,
        DMUL => v1 * v2,
        DDIV => v1 / v2,
        DREM => {
            if v1.is_nan() {
                v1
            } else if v2.is_nan() {
                v2
            } else if v1.is_finite() && v2.is_infinite() {
                v1
            } else {
                v1 % v2
            }
        }
        DNEG => -v1,
        _ => 0.0,
    }
}

fn three_way<T: PartialOrd>(a: T, b: T, unordered: i32) -> i32 {
    if a < b {
        -1
    } else if a > b {
        1
    } else if a == b {
        0
    } else {
        unordered
    }
}

pub extern "C" fn rt_h_lcmp(v1: i64, v2: i64) -> i32 {
    three_way(v1, v2, 0)
}

pub extern "C" fn rt_h_fcmp_g(v1: f32, v2: f32) -> i32 {
    three_way(v1, v2, 1)
}

pub extern "C" fn rt_h_fcmp_l(v1: f32, v2: f32) -> i32 {
    three_way(v1, v2, -1)
}

pub extern "C" fn rt_h_dcmp_g(v1: f64, v2: f64) -> i32 {
    three_way(v1, v2, 1)
}

pub extern "C" fn rt_h_dcmp_l(v1: f64, v2: f64) -> i32 {
    three_way(v1, v2, -1)
}

// Narrowing float conversions: `as` saturates and maps NaN to zero, which is
// the JVM rule.

pub extern "C" fn rt_h_f2i(v: f32) -> i32 {
    v as i32
}

pub extern "C" fn rt_h_f2l(v: f32) -> i64 {
    v as i64
}

pub extern "C" fn rt_h_d2i(v: f64) -> i32 {
    v as i32
}

pub extern "C" fn rt_h_d2l(v: f64) -> i64 {
    v as i64
}

pub extern "C" fn rt_h_i2f(v: i32) -> f32 {
    v as f32
}

pub extern "C" fn rt_h_i2d(v: i32) -> f64 {
    v as f64
}

pub extern "C" fn rt_h_l2f(v: i64) -> f32 {
    v as f32
}

pub extern "C" fn rt_h_l2d(v: i64) -> f64 {
    v as f64
}

pub extern "C" fn rt_h_f2d(v: f32) -> f64 {
    v as f64
}

pub extern "C" fn rt_h_d2f(v: f64) -> f32 {
    v as f32
}

pub extern "C" fn rt_h_i2l(v: i32) -> i64 {
    v as i64
}

pub extern "C" fn rt_h_l2i(v: i64) -> i32 {
    v as i32
}

pub extern "C" fn rt_h_i2b(v: i32) -> i32 {
    v as i8 as i32
}

pub extern "C" fn rt_h_i2c(v: i32) -> i32 {
    v as u16 as i32
}

pub extern "C" fn rt_h_i2s(v: i32) -> i32 {
    v as i16 as i32
}

/// Address of the binary-arithmetic helper for values of type `jt`.
pub fn arith_helper(jt: JType, op: u8) -> Option<u64> {
    let addr = match jt {
        JType::I32 => rt_h_i32_a as *const () as usize,
        JType::I64 if matches!(op, LSHL | LSHR | LUSHR) => rt_h_i64_shift as *const () as usize,
        JType::I64 => rt_h_i64_a as *const () as usize,
        JType::F32 => rt_h_flt_a as *const () as usize,
        JType::F64 => rt_h_dbl_a as *const () as usize,
        _ => return None,
    };
    Some(addr as u64)
}

/// Address of the helper implementing a comparison opcode.
pub fn cmp_helper(op: u8) -> Option<u64> {
    let addr = match op {
        LCMP => rt_h_lcmp as *const () as usize,
        FCMPL => rt_h_fcmp_l as *const () as usize,
        FCMPG => rt_h_fcmp_g as *const () as usize,
        DCMPL => rt_h_dcmp_l as *const () as usize,
        DCMPG => rt_h_dcmp_g as *const () as usize,
        _ => return None,
    };
    Some(addr as u64)
}

/// Conversion helper table indexed by source and destination type.
pub fn cnv_helper(from: JType, to: JType) -> Option<u64> {
    use JType::*;
    let addr = match (from, to) {
        (I32, I64) => rt_h_i2l as *const () as usize,
        (I32, F32) => rt_h_i2f as *const () as usize,
        (I32, F64) => rt_h_i2d as *const () as usize,
        (I64, I32) => rt_h_l2i as *const () as usize,
        (I64, F32) => rt_h_l2f as *const () as usize,
        (I64, F64) => rt_h_l2d as *const () as usize,
        (F32, I32) => rt_h_f2i as *const () as usize,
        (F32, I64) => rt_h_f2l as *const () as usize,
        (F32, F64) => rt_h_f2d as *const () as usize,
        (F64, I32) => rt_h_d2i as *const () as usize,
        (F64, I64) => rt_h_d2l as *const () as usize,
        (F64, F32) => rt_h_d2f as *const () as usize,
        (I32, I8) => rt_h_i2b as *const () as usize,
        (I32, U16) => rt_h_i2c as *const () as usize,
        (I32, I16) => rt_h_i2s as *const () as usize,
        _ => return None,
    };
    Some(addr as u64)
}

/// Source and destination types of a conversion opcode.
pub fn cnv_types(op: u8) -> Option<(JType, JType)> {
    use JType::*;
    Some(match op {
        I2L => (I32, I64),
        I2F => (I32, F32),
        I2D => (I32, F64),
        L2I => (I64, I32),
        L2F => (I64, F32),
        L2D => (I64, F64),
        F2I => (F32, I32),
        F2L => (F32, I64),
        F2D => (F32, F64),
        D2I => (F64, I32),
        D2L => (F64, I64),
        D2F => (F64, F32),
        I2B => (I32, I8),
        I2C => (I32, U16),
        I2S => (I32, I16),
        _ => return None,
    })
}

/// Evaluate a conversion over raw value bits, as the compiler does for constants.
pub fn fold_cnv(op: u8, bits: i64) -> Option<i64> {
    let f32_of = |b: i64| f32::from_bits(b as u32);
    let f64_of = |b: i64| f64::from_bits(b as u64);
    Some(match op {
        I2L => rt_h_i2l(bits as i32),
        I2F => rt_h_i2f(bits as i32).to_bits() as i64,
        I2D => rt_h_i2d(bits as i32).to_bits() as i64,
        L2I => rt_h_l2i(bits) as i64,
        L2F => rt_h_l2f(bits).to_bits() as i64,
        L2D => rt_h_l2d(bits).to_bits() as i64,
        F2I => rt_h_f2i(f32_of(bits)) as i64,
        F2L => rt_h_f2l(f32_of(bits)),
        F2D => rt_h_f2d(f32_of(bits)).to_bits() as i64,
        D2I => rt_h_d2i(f64_of(bits)) as i64,
        D2L => rt_h_d2l(f64_of(bits)),
        D2F => rt_h_d2f(f64_of(bits)).to_bits() as i64,
        I2B => rt_h_i2b(bits as i32) as i64,
        I2C => rt_h_i2c(bits as i32) as i64,
        I2S => rt_h_i2s(bits as i32) as i64,
        _ => return None,
    })
}

/// Evaluate a binary or negation opcode over raw value bits of type `jt`.
pub fn fold_arith(jt: JType, op: u8, a: i64, b: i64) -> Option<i64> {
    let op32 = op as u32;
    Some(match jt {
        JType::I32 => rt_h_i32_a(a as i32, b as i32, op32) as i64,
        JType::I64 if matches!(op, LSHL | LSHR | LUSHR) => rt_h_i64_shift(a, b as i32, op32),
        JType::I64 => rt_h_i64_a(a, b, op32),
        JType::F32 => {
            let r = rt_h_flt_a(f32::from_bits(a as u32), f32::from_bits(b as u32), op32);
            r.to_bits() as i64
        }
        JType::F64 => {
            let r = rt_h_dbl_a(f64::from_bits(a as u64), f64::from_bits(b as u64), op32);
            r.to_bits() as i64
        }
        _ => return None,
    })
}

/// Evaluate a comparison opcode over raw value bits.
pub fn fold_cmp(op: u8, a: i64, b: i64) -> Option<i32> {
    let f32_of = |b: i64| f32::from_bits(b as u32);
    let f64_of = |b: i64| f64::from_bits(b as u64);
    Some(match op {
        LCMP => rt_h_lcmp(a, b),
        FCMPL => rt_h_fcmp_l(f32_of(a), f32_of(b)),
        FCMPG => rt_h_fcmp_g(f32_of(a), f32_of(b)),
        DCMPL => rt_h_dcmp_l(f64_of(a), f64_of(b)),
        DCMPG => rt_h_dcmp_g(f64_of(a), f64_of(b)),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_division_corners() {
        assert_eq!(rt_h_i32_a(i32::MIN, -1, IDIV as u32), i32::MIN);
        assert_eq!(rt_h_i32_a(i32::MIN, -1, IREM as u32), 0);
        assert_eq!(rt_h_i32_a(7, 2, IDIV as u32), 3);
        assert_eq!(rt_h_i32_a(-7, 2, IREM as u32), -1);
        assert_eq!(rt_h_i32_a(5, 0, IDIV as u32), 0);
        assert_eq!(rt_h_i64_a(i64::MIN, -1, LDIV as u32), i64::MIN);
        assert_eq!(rt_h_i64_a(i64::MIN, -1, LREM as u32), 0);
    }

    #[test]
    fn test_shift_masks() {
        assert_eq!(rt_h_i32_a(1, 33, ISHL as u32), 2);
        assert_eq!(rt_h_i32_a(-8, 1, ISHR as u32), -4);
        assert_eq!(rt_h_i32_a(-1, 28, IUSHR as u32), 0xf);
        assert_eq!(rt_h_i32_a(-1, 32, IUSHR as u32), -1);
        assert_eq!(rt_h_i64_shift(1, 65, LSHL as u32), 2);
        assert_eq!(rt_h_i64_shift(-1, 60, LUSHR as u32), 0xf);
        assert_eq!(rt_h_i64_shift(i64::MIN, 63, LSHR as u32), -1);
    }

    #[test]
    fn test_float_remainder_rules() {
        let inf = f64::INFINITY;
        assert_eq!(rt_h_dbl_a(5.5, inf, DREM as u32), 5.5);
        assert_eq!(rt_h_dbl_a(-3.0, -inf, DREM as u32), -3.0);
        assert!(rt_h_dbl_a(inf, 2.0, DREM as u32).is_nan());
        assert!(rt_h_dbl_a(1.0, 0.0, DREM as u32).is_nan());
        assert_eq!(rt_h_dbl_a(7.5, 2.0, DREM as u32), 1.5);
        assert_eq!(rt_h_flt_a(1.25, f32::INFINITY, FREM as u32), 1.25);

        // The dividend's NaN wins.
        let n1 = f64::from_bits(0x7ff8_0000_0000_0001);
        let n2 = f64::from_bits(0x7ff8_0000_0000_0002);
        assert_eq!(rt_h_dbl_a(n1, n2, DREM as u32).to_bits(), n1.to_bits());
        assert_eq!(rt_h_dbl_a(1.0, n2, DREM as u32).to_bits(), n2.to_bits());
    }

    #[test]
    fn test_nan_comparisons() {
        let nan = f32::NAN;
        assert_eq!(rt_h_fcmp_g(nan, 1.0), 1);
        assert_eq!(rt_h_fcmp_l(nan, 1.0), -1);
        assert_eq!(rt_h_dcmp_g(1.0, f64::NAN), 1);
        assert_eq!(rt_h_dcmp_l(1.0, f64::NAN), -1);
        assert_eq!(rt_h_dcmp_l(2.0, 1.0), 1);
        assert_eq!(rt_h_fcmp_g(-0.0, 0.0), 0);
        assert_eq!(rt_h_lcmp(i64::MIN, i64::MAX), -1);
        assert_eq!(rt_h_lcmp(3, 3), 0);
    }

    #[test]
    fn test_narrowing_conversions() {
        assert_eq!(rt_h_d2i(f64::NAN), 0);
        assert_eq!(rt_h_d2i(1e300), i32::MAX);
        assert_eq!(rt_h_d2i(-1e300), i32::MIN);
        assert_eq!(rt_h_d2i(-2.9), -2);
        assert_eq!(rt_h_f2l(f32::INFINITY), i64::MAX);
        assert_eq!(rt_h_f2l(f32::NEG_INFINITY), i64::MIN);
        assert_eq!(rt_h_d2l(f64::NAN), 0);
        assert_eq!(rt_h_l2i(0x1_2345_6789), 0x2345_6789);
        assert_eq!(rt_h_i2c(-1), 0xffff);
        assert_eq!(rt_h_i2b(0x80), -128);
    }

    #[test]
    fn test_helper_tables() {
        let addr = |f: *const ()| Some(f as usize as u64);
        assert_eq!(arith_helper(JType::I32, IADD), addr(rt_h_i32_a as *const ()));
        assert_eq!(arith_helper(JType::I64, LSHL), addr(rt_h_i64_shift as *const ()));
        assert_eq!(arith_helper(JType::Ref, IADD), None);
        assert_eq!(cmp_helper(DCMPG), addr(rt_h_dcmp_g as *const ()));
        assert!(cnv_helper(JType::F64, JType::I32).is_some());
        assert!(cnv_helper(JType::Ref, JType::I32).is_none());
        for op in I2L..=I2S {
            let (from, to) = cnv_types(op).unwrap();
            assert!(cnv_helper(from, to).is_some());
        }
        assert_eq!(fold_cnv(D2I, f64::NAN.to_bits() as i64), Some(0));
        assert_eq!(fold_cnv(L2I, -1), Some(-1));
    }

    #[test]
    fn test_folding_matches_helpers() {
        assert_eq!(fold_arith(JType::I32, IADD, i32::MAX as i64, 1), Some(i32::MIN as i64));
        assert_eq!(fold_arith(JType::I64, LSHL, 1, 64), Some(1));
        let rem = fold_arith(JType::F64, DREM, 3.5f64.to_bits() as i64, f64::INFINITY.to_bits() as i64);
        assert_eq!(rem, Some(3.5f64.to_bits() as i64));
        assert_eq!(fold_arith(JType::Ref, IADD, 0, 0), None);
        let nan = f32::NAN.to_bits() as i64;
        assert_eq!(fold_cmp(FCMPG, nan, 0), Some(1));
        assert_eq!(fold_cmp(FCMPL, nan, 0), Some(-1));
        assert_eq!(fold_cmp(LCMP, -5, 3), Some(-1));
    }
}
