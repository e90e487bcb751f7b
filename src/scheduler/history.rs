//! Fixed-capacity FIFO of data-space estimates.

use candle_core::{DType, Device, Tensor};

use crate::Result;

/// Ring buffer holding the `N` most recent tensors; pushing into a full
/// buffer evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct DataHistory<const N: usize> {
    slots: [Option<Tensor>; N],
    /// Index of the slot the next push writes to.
    head: usize,
    len: usize,
}

impl<const N: usize> Default for DataHistory<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DataHistory<N> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            head: 0,
            len: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: Tensor) {
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % N;
        self.len = (self.len + 1).min(N);
    }

    /// Entry pushed `age` calls ago (`0` = most recent).
    pub fn back(&self, age: usize) -> Option<&Tensor> {
        if age >= self.len {
            return None;
        }
        let index = (self.head + N - 1 - age) % N;
        self.slots[index].as_ref()
    }

    pub fn latest(&self) -> Option<&Tensor> {
        self.back(0)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        (0..self.len).rev().filter_map(move |age| self.back(age))
    }

    pub fn clear(&mut self) {
        self.slots = std::array::from_fn(|_| None);
        self.head = 0;
        self.len = 0;
    }

    pub(crate) fn to(&mut self, device: Option<&Device>, dtype: Option<DType>) -> Result<()> {
        for tensor in self.slots.iter_mut().flatten() {
            if let Some(device) = device {
                *tensor = tensor.to_device(device)?;
            }
            if let Some(dtype) = dtype {
                *tensor = tensor.to_dtype(dtype)?;
            }
        }
        Ok(())
    }
}
