//! Numeric semantics of the opcodes that are more than a single native operation.
//!
//! Inputs are already-popped operands; trapping cases return `Err`.

use paste::paste;

use crate::error::*;

macro_rules! int_div {
    ($int:ident, $uint:ident) => {
        paste! {
            #[inline]
            pub fn [<$int _div_s>](a: $int, b: $int) -> Result<$int, Error> {
                if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                if a == $int::MIN && b == -1 { return Err(Error::trap(INTEGER_OVERFLOW)); }
                Ok(a / b)
            }

            #[inline]
            pub fn [<$int _div_u>](a: $int, b: $int) -> Result<$int, Error> {
                if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                Ok(((a as $uint) / (b as $uint)) as $int)
            }

            #[inline]
            pub fn [<$int _rem_s>](a: $int, b: $int) -> Result<$int, Error> {
                if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                Ok(a.wrapping_rem(b))
            }

            #[inline]
            pub fn [<$int _rem_u>](a: $int, b: $int) -> Result<$int, Error> {
                if b == 0 { return Err(Error::trap(DIVIDE_BY_ZERO)); }
                Ok(((a as $uint) % (b as $uint)) as $int)
            }
        }
    };
}

int_div!(i32, u32);
int_div!(i64, u64);

// Bounds are exclusive and exactly representable in the source float type.
macro_rules! trunc {
    ($name:ident, $src:ty => $dst:ty, $lo:expr, $hi:expr) => {
        #[inline]
        pub fn $name(x: $src) -> Result<$dst, Error> {
            if x.is_nan() { return Err(Error::trap(INVALID_CONV_TO_INT)); }
            if !(x > $lo && x < $hi) { return Err(Error::trap(INTEGER_OVERFLOW)); }
            Ok(x as $dst)
        }
    };
}

trunc!(i32_trunc_f32_s, f32 => i32, -2147483904.0, 2147483648.0);
trunc!(i32_trunc_f32_u, f32 => u32, -1.0, 4294967296.0);
trunc!(i32_trunc_f64_s, f64 => i32, -2147483649.0, 2147483648.0);
trunc!(i32_trunc_f64_u, f64 => u32, -1.0, 4294967296.0);
trunc!(i64_trunc_f32_s, f32 => i64, -9223373136366403584.0, 9223372036854775808.0);
trunc!(i64_trunc_f32_u, f32 => u64, -1.0, 18446744073709551616.0);
trunc!(i64_trunc_f64_s, f64 => i64, -9223372036854777856.0, 9223372036854775808.0);
trunc!(i64_trunc_f64_u, f64 => u64, -1.0, 18446744073709551616.0);

// `as` from float to int already saturates and maps NaN to zero.
#[inline] pub fn i32_trunc_sat_f32_s(x: f32) -> i32 { x as i32 }
#[inline] pub fn i32_trunc_sat_f32_u(x: f32) -> u32 { x as u32 }
#[inline] pub fn i32_trunc_sat_f64_s(x: f64) -> i32 { x as i32 }
#[inline] pub fn i32_trunc_sat_f64_u(x: f64) -> u32 { x as u32 }
#[inline] pub fn i64_trunc_sat_f32_s(x: f32) -> i64 { x as i64 }
#[inline] pub fn i64_trunc_sat_f32_u(x: f32) -> u64 { x as u64 }
#[inline] pub fn i64_trunc_sat_f64_s(x: f64) -> i64 { x as i64 }
#[inline] pub fn i64_trunc_sat_f64_u(x: f64) -> u64 { x as u64 }

macro_rules! float_ops {
    ($f:ident, $bits:ident, $sign:expr) => {
        paste! {
            /// NaN if either operand is NaN; `-0` is smaller than `+0`.
            #[inline]
            pub fn [<$f _min>](a: $f, b: $f) -> $f {
                if a.is_nan() || b.is_nan() { return a + b; }
                if a == b { return if a.is_sign_negative() { a } else { b }; }
                if a < b { a } else { b }
            }

            #[inline]
            pub fn [<$f _max>](a: $f, b: $f) -> $f {
                if a.is_nan() || b.is_nan() { return a + b; }
                if a == b { return if a.is_sign_positive() { a } else { b }; }
                if a > b { a } else { b }
            }

            /// Round to nearest, ties to even.
            #[inline]
            pub fn [<$f _nearest>](x: $f) -> $f { x.round_ties_even() }

            /// Magnitude of `a`, sign bit of `b`, NaN payloads included.
            #[inline]
            pub fn [<$f _copysign>](a: $f, b: $f) -> $f {
                $f::from_bits((a.to_bits() & !$sign) | (b.to_bits() & $sign))
            }

            #[inline]
            pub fn [<$f _abs>](x: $f) -> $f { $f::from_bits(x.to_bits() & !$sign) }

            #[inline]
            pub fn [<$f _neg>](x: $f) -> $f { $f::from_bits(x.to_bits() ^ $sign) }
        }
    };
}

float_ops!(f32, u32, 0x8000_0000u32);
float_ops!(f64, u64, 0x8000_0000_0000_0000u64);

#[inline] pub fn f32_convert_i64_u(x: i64) -> f32 { x as u64 as f32 }
#[inline] pub fn f64_convert_i64_u(x: i64) -> f64 { x as u64 as f64 }
#[inline] pub fn f32_convert_i32_u(x: i32) -> f32 { x as u32 as f32 }
#[inline] pub fn f64_convert_i32_u(x: i32) -> f64 { x as u32 as f64 }
