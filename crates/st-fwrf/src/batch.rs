use crate::error::{FwrfError, FwrfResult};
use std::ops::Range;

/// Contiguous slice of an axis processed as one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub start: usize,
    pub len: usize,
}

impl BatchRange {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Iterator over `length / size` full batches followed by one residual batch
/// when `length` is not a multiple of `size`.
#[derive(Debug, Clone)]
pub struct Batches {
    next: usize,
    end: usize,
    size: usize,
}

impl Iterator for Batches {
    type Item = BatchRange;

    fn next(&mut self) -> Option<BatchRange> {
        if self.next >= self.end {
            return None;
        }
        let len = self.size.min(self.end - self.next);
        let batch = BatchRange {
            start: self.next,
            len,
        };
        self.next += len;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next);
        let count = (remaining + self.size - 1) / self.size;
        (count, Some(count))
    }
}

impl ExactSizeIterator for Batches {}

/// Splits `start..start + length` into batches of `size`.
pub fn batches(start: usize, length: usize, size: usize, axis: &'static str) -> FwrfResult<Batches> {
    if size == 0 {
        return Err(FwrfError::ZeroBatchSize { axis });
    }
    Ok(Batches {
        next: start,
        end: start + length,
        size,
    })
}

/// Number of full candidate batches; rejects any residual.
pub fn exact_batch_count(candidates: usize, size: usize) -> FwrfResult<usize> {
    if size == 0 {
        return Err(FwrfError::ZeroBatchSize { axis: "candidate" });
    }
    if candidates % size != 0 {
        return Err(FwrfError::CandidateBatchMismatch {
            batch: size,
            candidates,
        });
    }
    Ok(candidates / size)
}

/// Full batch count and residual length, as logged before a session starts.
pub fn layout(length: usize, size: usize) -> (usize, usize) {
    if size == 0 {
        return (0, length);
    }
    (length / size, length % size)
}
