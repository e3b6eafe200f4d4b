use std::{
    fmt::{self, Display},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};

/// Resource vector used both for job demands and node limits: user slots,
/// cpu, memory and network. Arithmetic is saturating on the integer axes so
/// aggregate accounting never wraps on transient over-release.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub user_slots: usize,
    pub cpu: f64,
    pub memory_bytes: i64,
    pub network: i64,
}

impl ResourceRequest {
    pub fn new(user_slots: usize, cpu: f64, memory_bytes: i64, network: i64) -> Self {
        Self {
            user_slots,
            cpu,
            memory_bytes,
            network,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn from_memory(memory_bytes: i64) -> Self {
        Self {
            user_slots: 1,
            cpu: 1.0,
            memory_bytes,
            network: 0,
        }
    }

    /// True when every component of `self` is at least the corresponding
    /// component of `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        self.user_slots >= other.user_slots
            && self.cpu >= other.cpu
            && self.memory_bytes >= other.memory_bytes
            && self.network >= other.network
    }

    #[must_use]
    pub fn multiply(&self, count: usize) -> Self {
        Self {
            user_slots: self.user_slots.saturating_mul(count),
            cpu: self.cpu * count as f64,
            memory_bytes: self.memory_bytes.saturating_mul(count as i64),
            network: self.network.saturating_mul(count as i64),
        }
    }

}

impl Add for ResourceRequest {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            user_slots: self.user_slots.saturating_add(rhs.user_slots),
            cpu: self.cpu + rhs.cpu,
            memory_bytes: self.memory_bytes.saturating_add(rhs.memory_bytes),
            network: self.network.saturating_add(rhs.network),
        }
    }
}

impl AddAssign for ResourceRequest {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceRequest {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            user_slots: self.user_slots.saturating_sub(rhs.user_slots),
            cpu: self.cpu - rhs.cpu,
            memory_bytes: self.memory_bytes.saturating_sub(rhs.memory_bytes),
            network: self.network.saturating_sub(rhs.network),
        }
    }
}

impl SubAssign for ResourceRequest {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{slots: {}, cpu: {}, memory: {}, network: {}}}",
            self.user_slots, self.cpu, self.memory_bytes, self.network
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominates_is_componentwise() {
        let limits = ResourceRequest::new(10, 8.0, 1 << 30, 100);
        let small = ResourceRequest::new(1, 1.0, 1 << 20, 0);
        assert!(limits.dominates(&small));
        assert!(!small.dominates(&limits));

        let wide = ResourceRequest::new(1, 16.0, 1 << 20, 0);
        assert!(!limits.dominates(&wide));
    }

    #[test]
    fn multiply_and_add_accumulate() {
        let one = ResourceRequest::new(1, 2.0, 100, 10);
        let five = one.multiply(5);
        assert_eq!(five.user_slots, 5);
        assert_eq!(five.memory_bytes, 500);
        let sum = five + one;
        assert_eq!(sum.user_slots, 6);
        assert_eq!(sum.network, 60);
    }

    #[test]
    fn sub_saturates_on_integer_axes() {
        let a = ResourceRequest::new(1, 1.0, 100, 0);
        let b = ResourceRequest::new(2, 1.0, 200, 10);
        let diff = a - b;
        assert_eq!(diff.user_slots, 0);
        assert_eq!(diff.memory_bytes, 0);
        assert_eq!(diff.network, 0);
    }
}
