//! 协调器内的单调序号：端点与 AI 调用共用，作为 checkpoint 的恢复键

use std::sync::atomic::{AtomicI64, Ordering};

/// 序号起点
pub const SEQUENCE_START: i64 = 1000;

#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(SEQUENCE_START)
    }

    pub fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let ids = SequenceGenerator::new();
        let a = ids.next();
        let b = ids.next();
        assert_eq!(a, SEQUENCE_START);
        assert!(b > a);
        assert_eq!(ids.peek(), b + 1);
    }
}
