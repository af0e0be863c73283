use std::fmt::{Display, Formatter};

use crate::instance::InstanceId;
use crate::wasm_table::pack_funcref;

/// Raw encoding of a null reference on the operand stack, in locals and in table slots.
pub const REF_NULL: u64 = u64::MAX;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32 = 0x7f,
    I64 = 0x7e,
    F32 = 0x7d,
    F64 = 0x7c,
    V128 = 0x7b,
    FuncRef = 0x70,
    ExternRef = 0x6f,
    ExnRef = 0x69,
}

impl ValType {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<ValType> {
        match byte {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            0x7b => Some(ValType::V128),
            0x70 => Some(ValType::FuncRef),
            0x6f => Some(ValType::ExternRef),
            0x69 => Some(ValType::ExnRef),
            _ => None,
        }
    }

    /// Number of 64-bit stack words a value of this type occupies.
    #[inline(always)]
    pub fn words(self) -> usize { if self == ValType::V128 { 2 } else { 1 } }

    #[inline]
    pub fn is_ref(self) -> bool { matches!(self, ValType::FuncRef | ValType::ExternRef | ValType::ExnRef) }

    /// Raw word(s) of the type's zero value; references default to null.
    #[inline]
    pub fn zero_word(self) -> u64 { if self.is_ref() { REF_NULL } else { 0 } }
}

impl Display for ValType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
            ValType::ExnRef => "exnref",
        })
    }
}

/// A raw 64-bit stack word and the bit-exact conversions into and out of it.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Word(pub u64);

impl Word {
    #[inline] pub fn from_i32(v: i32) -> Self { Self(v as u32 as u64) }
    #[inline] pub fn as_i32(self) -> i32 { self.0 as u32 as i32 }
    #[inline] pub fn from_u32(v: u32) -> Self { Self(v as u64) }
    #[inline] pub fn as_u32(self) -> u32 { self.0 as u32 }
    #[inline] pub fn from_i64(v: i64) -> Self { Self(v as u64) }
    #[inline] pub fn as_i64(self) -> i64 { self.0 as i64 }
    #[inline] pub fn from_u64(v: u64) -> Self { Self(v) }
    #[inline] pub fn as_u64(self) -> u64 { self.0 }
    #[inline] pub fn from_f32(v: f32) -> Self { Self(v.to_bits() as u64) }
    #[inline] pub fn as_f32(self) -> f32 { f32::from_bits(self.0 as u32) }
    #[inline] pub fn from_f64(v: f64) -> Self { Self(v.to_bits()) }
    #[inline] pub fn as_f64(self) -> f64 { f64::from_bits(self.0) }
}

/// A function reference that names the instance whose index space `func_idx` belongs to.
///
/// Instance 0 is never allocated; a reference built with it resolves against
/// whichever instance stores or calls it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FuncAddr {
    pub instance: InstanceId,
    pub func_idx: u32,
}

impl FuncAddr {
    pub const fn new(instance: InstanceId, func_idx: u32) -> Self { Self { instance, func_idx } }

    /// A reference to `func_idx` of the instance that receives it.
    pub const fn local(func_idx: u32) -> Self { Self { instance: 0, func_idx } }

    #[inline]
    pub fn to_word(self) -> u64 { pack_funcref(self.instance, self.func_idx) }

    #[inline]
    pub fn from_word(w: u64) -> Self { Self { instance: (w >> 32) as InstanceId, func_idx: w as u32 } }
}

/// A typed runtime value, as seen by host code.
///
/// Floats keep their exact bit pattern, so equality is bitwise: two NaNs with
/// the same payload compare equal and `0.0 != -0.0`.
#[derive(Copy, Clone, Debug)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    FuncRef(Option<FuncAddr>),
    ExternRef(Option<u32>),
    /// Handle of a caught exception in this thread's exception store.
    ExnRef(Option<u32>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::V128(a), Value::V128(b)) => a == b,
            (Value::FuncRef(a), Value::FuncRef(b)) => a == b,
            (Value::ExternRef(a), Value::ExternRef(b)) | (Value::ExnRef(a), Value::ExnRef(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
            Value::FuncRef(_) => ValType::FuncRef,
            Value::ExternRef(_) => ValType::ExternRef,
            Value::ExnRef(_) => ValType::ExnRef,
        }
    }

    pub fn default_for(ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
            ValType::V128 => Value::V128(0),
            ValType::FuncRef => Value::FuncRef(None),
            ValType::ExternRef => Value::ExternRef(None),
            ValType::ExnRef => Value::ExnRef(None),
        }
    }

    /// Low and high words; the high word is only meaningful for v128.
    pub fn to_words(&self) -> (u64, u64) {
        match *self {
            Value::I32(v) => (Word::from_i32(v).0, 0),
            Value::I64(v) => (v as u64, 0),
            Value::F32(v) => (Word::from_f32(v).0, 0),
            Value::F64(v) => (v.to_bits(), 0),
            Value::V128(v) => (v as u64, (v >> 64) as u64),
            Value::FuncRef(r) => (r.map_or(REF_NULL, FuncAddr::to_word), 0),
            Value::ExternRef(r) | Value::ExnRef(r) => (ref_to_word(r), 0),
        }
    }

    pub fn from_words(ty: ValType, lo: u64, hi: u64) -> Value {
        match ty {
            ValType::I32 => Value::I32(Word(lo).as_i32()),
            ValType::I64 => Value::I64(lo as i64),
            ValType::F32 => Value::F32(Word(lo).as_f32()),
            ValType::F64 => Value::F64(f64::from_bits(lo)),
            ValType::V128 => Value::V128(((hi as u128) << 64) | lo as u128),
            ValType::FuncRef => Value::FuncRef((lo != REF_NULL).then(|| FuncAddr::from_word(lo))),
            ValType::ExternRef => Value::ExternRef(word_to_ref(lo)),
            ValType::ExnRef => Value::ExnRef(word_to_ref(lo)),
        }
    }

    /// Appends the value's stack words.
    pub fn push_words(&self, out: &mut Vec<u64>) {
        let (lo, hi) = self.to_words();
        out.push(lo);
        if self.ty() == ValType::V128 {
            out.push(hi);
        }
    }

    /// Decodes a sequence of typed values from consecutive stack words.
    pub fn read_words(types: &[ValType], words: &[u64]) -> Vec<Value> {
        let mut out = Vec::with_capacity(types.len());
        let mut i = 0;
        for &ty in types {
            let lo = words.get(i).copied().unwrap_or(0);
            let hi = if ty == ValType::V128 { words.get(i + 1).copied().unwrap_or(0) } else { 0 };
            out.push(Value::from_words(ty, lo, hi));
            i += ty.words();
        }
        out
    }

    pub fn i32(&self) -> Option<i32> { if let Value::I32(v) = self { Some(*v) } else { None } }
    pub fn i64(&self) -> Option<i64> { if let Value::I64(v) = self { Some(*v) } else { None } }
    pub fn f32(&self) -> Option<f32> { if let Value::F32(v) = self { Some(*v) } else { None } }
    pub fn f64(&self) -> Option<f64> { if let Value::F64(v) = self { Some(*v) } else { None } }
    pub fn v128(&self) -> Option<u128> { if let Value::V128(v) = self { Some(*v) } else { None } }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}:i32"),
            Value::I64(v) => write!(f, "{v}:i64"),
            Value::F32(v) => write!(f, "{v}:f32"),
            Value::F64(v) => write!(f, "{v}:f64"),
            Value::V128(v) => write!(f, "{v:#034x}:v128"),
            Value::FuncRef(Some(a)) => write!(f, "func {}:{}", a.instance, a.func_idx),
            Value::ExternRef(Some(i)) => write!(f, "extern {i}"),
            Value::ExnRef(Some(i)) => write!(f, "exn {i}"),
            Value::FuncRef(None) | Value::ExternRef(None) | Value::ExnRef(None) => f.write_str("null"),
        }
    }
}

#[inline]
pub fn ref_to_word(r: Option<u32>) -> u64 { r.map_or(REF_NULL, |i| i as u64) }

#[inline]
pub fn word_to_ref(w: u64) -> Option<u32> { if w == REF_NULL { None } else { Some(w as u32) } }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_bits_survive_word_roundtrip() {
        let neg_zero = Value::F32(-0.0);
        let (lo, hi) = neg_zero.to_words();
        assert_eq!(lo, 0x8000_0000);
        assert_eq!(Value::from_words(ValType::F32, lo, hi), neg_zero);
        assert_ne!(Value::F32(0.0), neg_zero);

        let payload = f64::from_bits(0x7ff4_0000_0000_0001);
        let (lo, _) = Value::F64(payload).to_words();
        assert_eq!(lo, 0x7ff4_0000_0000_0001);
    }

    #[test]
    fn i32_words_are_zero_extended() {
        assert_eq!(Value::I32(-1).to_words().0, 0xffff_ffff);
        assert_eq!(Word::from_i32(-2).as_i32(), -2);
    }

    #[test]
    fn v128_occupies_two_words() {
        let v = Value::V128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        let mut words = Vec::new();
        v.push_words(&mut words);
        Value::I32(7).push_words(&mut words);
        assert_eq!(words.len(), 3);
        let back = Value::read_words(&[ValType::V128, ValType::I32], &words);
        assert_eq!(back, vec![v, Value::I32(7)]);
    }

    #[test]
    fn null_refs_use_sentinel() {
        assert_eq!(Value::FuncRef(None).to_words().0, REF_NULL);
        assert_eq!(Value::from_words(ValType::ExternRef, 5, 0), Value::ExternRef(Some(5)));
        assert_eq!(ValType::FuncRef.zero_word(), REF_NULL);
        assert_eq!(ValType::ExnRef.zero_word(), REF_NULL);
    }

    #[test]
    fn funcref_keeps_its_owner() {
        let r = Value::FuncRef(Some(FuncAddr::new(7, 3)));
        let (lo, _) = r.to_words();
        assert_eq!(lo, (7 << 32) | 3);
        assert_eq!(Value::from_words(ValType::FuncRef, lo, 0), r);
        assert_ne!(Value::FuncRef(Some(FuncAddr::local(3))), r);
        assert_eq!(Value::FuncRef(Some(FuncAddr::local(3))).to_words().0, 3);
    }
}
