use crate::error::*;
use crate::instance::InstanceId;
use crate::value::{ValType, REF_NULL};

/// Hard cap on table length, independent of the declared maximum.
pub const MAX_TABLE_SIZE: u32 = 10_000_000;

/// One table slot: the raw reference plus the instance whose function index
/// space it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub value: u64,
    pub owner: Option<InstanceId>,
}

impl TableEntry {
    pub const NULL: TableEntry = TableEntry { value: REF_NULL, owner: None };

    #[inline]
    pub fn is_null(&self) -> bool { self.value == REF_NULL }

    /// Operand-stack encoding. Function references carry their owner in the high half.
    #[inline]
    pub fn to_word(self) -> u64 {
        match self.owner {
            Some(id) if !self.is_null() => ((id as u64) << 32) | (self.value & 0xffff_ffff),
            _ => self.value,
        }
    }

    #[inline]
    pub fn from_word(elem_type: ValType, w: u64) -> Self {
        if w == REF_NULL || elem_type != ValType::FuncRef {
            return Self { value: w, owner: None };
        }
        let owner = (w >> 32) as InstanceId;
        Self { value: w & 0xffff_ffff, owner: (owner != 0).then_some(owner) }
    }
}

#[inline]
pub fn pack_funcref(owner: InstanceId, func_idx: u32) -> u64 { ((owner as u64) << 32) | func_idx as u64 }

#[derive(Debug)]
pub struct Table {
    elem_type: ValType,
    entries: Vec<TableEntry>,
    maximum: Option<u32>,
}

impl Table {
    pub fn new(elem_type: ValType, initial: u32, maximum: Option<u32>) -> Self {
        Self { elem_type, entries: vec![TableEntry::NULL; initial as usize], maximum }
    }

    pub fn elem_type(&self) -> ValType { self.elem_type }
    #[inline]
    pub fn size(&self) -> u32 { self.entries.len() as u32 }
    pub fn maximum(&self) -> Option<u32> { self.maximum }

    /// Returns the previous size, or `u32::MAX` if the table cannot grow by `delta`.
    pub fn grow(&mut self, delta: u32, init: u64, owner: Option<InstanceId>) -> u32 {
        let old = self.size();
        let limit = self.maximum.unwrap_or(u32::MAX).min(MAX_TABLE_SIZE);
        match old.checked_add(delta) {
            Some(new) if new <= limit => {
                self.entries.resize(new as usize, TableEntry { value: init, owner });
                old
            }
            _ => u32::MAX,
        }
    }

    #[inline]
    pub fn get(&self, idx: u32) -> Result<TableEntry, Error> {
        self.entries.get(idx as usize).copied().ok_or_else(|| Error::trap(OOB_TABLE_ACCESS))
    }

    /// Raw slot value for dispatch; out-of-range is an undefined element.
    #[inline]
    pub fn ref_at(&self, idx: u32) -> Result<u64, Error> {
        self.entries.get(idx as usize).map(|e| e.value).ok_or_else(|| Error::trap(UNDEF_ELEM))
    }

    /// Like [`Table::ref_at`], but a null slot traps as well.
    #[inline]
    pub fn required_ref(&self, idx: u32) -> Result<TableEntry, Error> {
        let entry = self.entries.get(idx as usize).ok_or_else(|| Error::trap(UNDEF_ELEM))?;
        if entry.is_null() {
            return Err(Error::trap(UNINITIALIZED_ELEM));
        }
        Ok(*entry)
    }

    pub fn set_ref(&mut self, idx: u32, value: u64, owner: Option<InstanceId>) -> Result<(), Error> {
        let slot = self.entries.get_mut(idx as usize).ok_or_else(|| Error::trap(OOB_TABLE_ACCESS))?;
        *slot = TableEntry { value, owner };
        Ok(())
    }

    pub fn instance(&self, idx: u32) -> Option<InstanceId> {
        self.entries.get(idx as usize).and_then(|e| e.owner)
    }

    pub fn reset(&mut self) { self.entries.fill(TableEntry::NULL); }

    #[inline]
    fn check_range(len: usize, start: u32, n: u32) -> Result<std::ops::Range<usize>, Error> {
        let end = start as u64 + n as u64;
        if end > len as u64 {
            return Err(Error::trap(OOB_TABLE_ACCESS));
        }
        Ok(start as usize..end as usize)
    }

    pub fn fill(&mut self, start: u32, value: u64, owner: Option<InstanceId>, n: u32) -> Result<(), Error> {
        let range = Self::check_range(self.entries.len(), start, n)?;
        self.entries[range].fill(TableEntry { value, owner });
        Ok(())
    }

    /// Overlap-safe copy inside this table.
    pub fn copy_within(&mut self, dst: u32, src: u32, n: u32) -> Result<(), Error> {
        let from = Self::check_range(self.entries.len(), src, n)?;
        Self::check_range(self.entries.len(), dst, n)?;
        self.entries.copy_within(from, dst as usize);
        Ok(())
    }

    pub fn copy_from(&mut self, other: &Table, dst: u32, src: u32, n: u32) -> Result<(), Error> {
        let from = Self::check_range(other.entries.len(), src, n)?;
        let to = Self::check_range(self.entries.len(), dst, n)?;
        self.entries[to].copy_from_slice(&other.entries[from]);
        Ok(())
    }

    /// `table.init`: copies `n` stack-encoded references of `segment`, starting at `src`.
    pub fn init(&mut self, dst: u32, segment: &[u64], src: u32, n: u32) -> Result<(), Error> {
        let from = Self::check_range(segment.len(), src, n)?;
        let to = Self::check_range(self.entries.len(), dst, n)?;
        let elem_type = self.elem_type;
        for (slot, &w) in self.entries[to].iter_mut().zip(&segment[from]) {
            *slot = TableEntry::from_word(elem_type, w);
        }
        Ok(())
    }
}
