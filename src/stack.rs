use crate::error::*;

/// Untyped operand stack of 64-bit words.
#[derive(Debug, Default)]
pub struct MStack {
    words: Vec<u64>,
}

impl MStack {
    pub fn with_capacity(capacity: usize) -> Self { Self { words: Vec::with_capacity(capacity) } }

    #[inline(always)]
    pub fn len(&self) -> usize { self.words.len() }
    #[inline(always)]
    pub fn is_empty(&self) -> bool { self.words.is_empty() }
    #[inline(always)]
    pub fn push(&mut self, w: u64) { self.words.push(w); }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<u64, Error> {
        self.words.pop().ok_or_else(|| Error::trap(STACK_UNDERFLOW))
    }

    #[inline(always)]
    pub fn peek(&self) -> Result<u64, Error> {
        self.words.last().copied().ok_or_else(|| Error::trap(STACK_UNDERFLOW))
    }

    /// Removes the top `n` words, returning them bottom-first.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<u64>, Error> {
        let start = self.words.len().checked_sub(n).ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
        Ok(self.words.split_off(start))
    }

    pub fn extend_from_slice(&mut self, words: &[u64]) { self.words.extend_from_slice(words); }

    #[inline]
    pub fn truncate(&mut self, height: usize) { self.words.truncate(height); }

    /// Keeps the top `keep` words and discards everything between them and `height`.
    #[inline]
    pub fn unwind(&mut self, height: usize, keep: usize) -> Result<(), Error> {
        let len = self.words.len();
        if len < height + keep {
            return Err(Error::trap(STACK_UNDERFLOW));
        }
        if len > height + keep {
            self.words.copy_within(len - keep..len, height);
            self.words.truncate(height + keep);
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u64] { &self.words }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_past_bottom_traps() {
        let mut s = MStack::default();
        s.push(1);
        assert_eq!(s.pop(), Ok(1));
        assert_eq!(s.pop(), Err(Error::trap(STACK_UNDERFLOW)));
        assert!(s.peek().is_err());
    }

    #[test]
    fn unwind_keeps_top_values_at_height() {
        let mut s = MStack::default();
        s.extend_from_slice(&[10, 20, 1, 2, 3, 4, 5]);
        s.unwind(2, 2).unwrap();
        assert_eq!(s.as_slice(), &[10, 20, 4, 5]);
        s.unwind(0, 0).unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn unwind_rejects_missing_results() {
        let mut s = MStack::default();
        s.extend_from_slice(&[1]);
        assert!(s.unwind(1, 1).is_err());
    }

    #[test]
    fn pop_n_returns_in_push_order() {
        let mut s = MStack::default();
        s.extend_from_slice(&[1, 2, 3]);
        assert_eq!(s.pop_n(2).unwrap(), vec![2, 3]);
        assert_eq!(s.len(), 1);
        assert!(s.pop_n(2).is_err());
    }
}
