// SPDX-License-Identifier: GPL-2.0
//
// Exclusive-access CPU mask in the host representation. Used for topology
// input, per-task allowed masks and idle mask snapshots. Atomic per-bit
// updates live in `bitmap::ScxBitmap`; this type statically cannot be
// mutated through a shared handle.

use bitvec::prelude::*;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
    nr_bits: usize,
}

impl Cpumask {
    pub fn new(nr_bits: usize) -> Self {
        Self {
            mask: bitvec![u64, Lsb0; 0; nr_bits],
            nr_bits,
        }
    }

    pub fn nr_bits(&self) -> usize {
        self.nr_bits
    }

    pub fn set_cpu(&mut self, cpu: usize) -> Result<(), Error> {
        if cpu >= self.nr_bits {
            return Err(Error::InvalidArg);
        }
        self.mask.set(cpu, true);
        Ok(())
    }

    pub fn clear_cpu(&mut self, cpu: usize) -> Result<(), Error> {
        if cpu >= self.nr_bits {
            return Err(Error::InvalidArg);
        }
        self.mask.set(cpu, false);
        Ok(())
    }

    #[inline]
    pub fn test_cpu(&self, cpu: usize) -> bool {
        self.mask.get(cpu).map(|b| *b).unwrap_or(false)
    }

    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        !self.mask.any()
    }

    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut out = self.clone();
        let other_words = other.mask.as_raw_slice();
        for (idx, word) in out.mask.as_raw_mut_slice().iter_mut().enumerate() {
            *word &= other_words.get(idx).copied().unwrap_or(0);
        }
        out
    }

    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut out = self.clone();
        let other_words = other.mask.as_raw_slice();
        for (idx, word) in out.mask.as_raw_mut_slice().iter_mut().enumerate() {
            *word |= other_words.get(idx).copied().unwrap_or(0);
        }
        out
    }

    /// Iterate over set CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }

    /// Raw 64-bit words, least significant CPU first.
    pub fn words(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }
}

impl std::fmt::Display for Cpumask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for word in self.words().iter().rev() {
            write!(f, "{:016x} ", word)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_weight() {
        let mut m = Cpumask::new(9);
        m.set_cpu(0).unwrap();
        m.set_cpu(8).unwrap();
        assert_eq!(m.set_cpu(9), Err(Error::InvalidArg));
        assert_eq!(m.weight(), 2);
        assert!(m.test_cpu(8));
        assert!(!m.test_cpu(9));
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 8]);
    }

    #[test]
    fn test_and_or() {
        let mut a = Cpumask::new(16);
        let mut b = Cpumask::new(16);
        a.set_cpu(1).unwrap();
        a.set_cpu(2).unwrap();
        b.set_cpu(2).unwrap();
        b.set_cpu(3).unwrap();
        assert_eq!(a.and(&b).iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(a.or(&b).weight(), 3);
    }
}
