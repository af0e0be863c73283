use std::fmt::{Display, Formatter};

use crate::value::ValType;

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self { params: params.into(), results: results.into() }
    }

    #[inline]
    pub fn param_words(&self) -> usize { self.params.iter().map(|t| t.words()).sum() }
    #[inline]
    pub fn result_words(&self) -> usize { self.results.iter().map(|t| t.words()).sum() }
}

impl Display for FuncType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let list = |f: &mut Formatter<'_>, tys: &[ValType]| -> std::fmt::Result {
            f.write_str("(")?;
            for (i, t) in tys.iter().enumerate() {
                if i > 0 { f.write_str(", ")?; }
                write!(f, "{t}")?;
            }
            f.write_str(")")
        };
        list(f, &self.params)?;
        f.write_str(" -> ")?;
        list(f, &self.results)
    }
}

/// Block type as written in a block/loop/if header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    Type(u32),
}

/// Word counts consumed and produced by a structured region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arity {
    pub params: u32,
    pub results: u32,
}

impl BlockType {
    /// Resolves to word counts; `None` when a type index is out of range.
    pub fn arity(self, types: &[FuncType]) -> Option<Arity> {
        match self {
            BlockType::Empty => Some(Arity::default()),
            BlockType::Value(t) => Some(Arity { params: 0, results: t.words() as u32 }),
            BlockType::Type(idx) => types.get(idx as usize).map(|ty| Arity {
                params: ty.param_words() as u32,
                results: ty.result_words() as u32,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_arity_counts_words() {
        let types = vec![FuncType::new([ValType::I32, ValType::V128], [ValType::F64])];
        assert_eq!(BlockType::Type(0).arity(&types), Some(Arity { params: 3, results: 1 }));
        assert_eq!(BlockType::Value(ValType::V128).arity(&types), Some(Arity { params: 0, results: 2 }));
        assert_eq!(BlockType::Type(4).arity(&types), None);
    }

    #[test]
    fn display_lists_types() {
        let ty = FuncType::new([ValType::I32, ValType::I64], [ValType::F32]);
        assert_eq!(ty.to_string(), "(i32, i64) -> (f32)");
    }
}
