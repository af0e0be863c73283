//! Tags and thrown exceptions.
//!
//! A tag's identity is its allocation: an imported tag is the exporter's `Arc`,
//! so `catch` clauses compare tags with [`Arc::ptr_eq`]. Exceptions that wasm code
//! holds as `exnref` live in a per-thread store and are addressed by slot.

use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};

use crate::error::*;
use crate::signature::FuncType;
use crate::value::Value;

#[derive(Debug)]
pub struct Tag {
    ty: FuncType,
}

impl Tag {
    pub fn new(ty: FuncType) -> Arc<Self> { Arc::new(Self { ty }) }

    /// Payload types are the params; results are always empty.
    pub fn ty(&self) -> &FuncType { &self.ty }
}

pub struct Exception {
    tag: Arc<Tag>,
    payload: Vec<u64>,
    slot: OnceLock<u32>,
}

thread_local! {
    static EXCEPTIONS: RefCell<Vec<Arc<Exception>>> = const { RefCell::new(Vec::new()) };
}

impl Exception {
    /// Builds an exception a host function can return as [`Error::Exception`].
    pub fn new(tag: Arc<Tag>, args: &[Value]) -> Result<Arc<Self>, Error> {
        let params = &tag.ty.params;
        if args.len() != params.len() || args.iter().zip(params).any(|(a, t)| a.ty() != *t) {
            return Err(Error::trap(TYPE_MISMATCH));
        }
        let mut payload = Vec::with_capacity(tag.ty.param_words());
        for arg in args {
            arg.push_words(&mut payload);
        }
        Ok(Self::from_words(tag, payload))
    }

    pub(crate) fn from_words(tag: Arc<Tag>, payload: Vec<u64>) -> Arc<Self> {
        Arc::new(Self { tag, payload, slot: OnceLock::new() })
    }

    pub fn tag(&self) -> &Arc<Tag> { &self.tag }

    pub fn values(&self) -> Vec<Value> { Value::read_words(&self.tag.ty.params, &self.payload) }

    #[inline]
    pub(crate) fn payload(&self) -> &[u64] { &self.payload }

    /// `exnref` word for this exception, registering it on first use.
    pub(crate) fn to_word(self: &Arc<Self>) -> u64 {
        let slot = self.slot.get_or_init(|| {
            EXCEPTIONS.with(|store| {
                let mut store = store.borrow_mut();
                store.push(self.clone());
                store.len() as u32 - 1
            })
        });
        *slot as u64
    }

    pub(crate) fn from_word(w: u64) -> Option<Arc<Self>> {
        let slot = usize::try_from(w).ok()?;
        EXCEPTIONS.with(|store| store.borrow().get(slot).cloned())
    }
}

impl Debug for Exception {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exception").field("tag", &self.tag.ty).field("payload", &self.payload).finish()
    }
}

/// Exceptions compare by identity, like the tags they carry.
impl PartialEq for Exception {
    fn eq(&self, other: &Self) -> bool { std::ptr::eq(self, other) }
}

impl Eq for Exception {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValType;

    #[test]
    fn new_checks_payload_types() {
        let tag = Tag::new(FuncType::new([ValType::I32, ValType::F64], []));
        let exn = Exception::new(tag.clone(), &[Value::I32(4), Value::F64(-0.5)]).unwrap();
        assert_eq!(exn.values(), vec![Value::I32(4), Value::F64(-0.5)]);
        assert!(Arc::ptr_eq(exn.tag(), &tag));
        assert_eq!(Exception::new(tag.clone(), &[Value::I32(4)]).unwrap_err(), Error::trap(TYPE_MISMATCH));
        assert_eq!(Exception::new(tag, &[Value::I64(4), Value::F64(0.0)]).unwrap_err(), Error::trap(TYPE_MISMATCH));
    }

    #[test]
    fn exnref_words_are_stable() {
        let tag = Tag::new(FuncType::default());
        let a = Exception::new(tag.clone(), &[]).unwrap();
        let b = Exception::new(tag, &[]).unwrap();
        let wa = a.to_word();
        assert_eq!(a.to_word(), wa);
        assert_ne!(b.to_word(), wa);
        assert!(Arc::ptr_eq(&Exception::from_word(wa).unwrap(), &a));
        assert!(Exception::from_word(u64::MAX).is_none());
    }
}
