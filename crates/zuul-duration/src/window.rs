//! Growth/decay arithmetic for a ChangeQueue's actionable window (spec §5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowGrowthType {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowPolicy {
    pub initial: u32,
    pub floor: u32,
    pub increase_type: WindowGrowthType,
    pub increase_factor: u32,
    pub decrease_type: WindowGrowthType,
    pub decrease_factor: u32,
}

impl WindowPolicy {
    /// A queue whose window never moves (factors of 1 under exponential
    /// growth in both directions) keeps its window fixed across reconfigure
    /// rather than resetting to `initial` (spec §5).
    pub fn is_static(&self) -> bool {
        self.increase_factor == 1
            && self.decrease_factor == 1
            && self.increase_type == WindowGrowthType::Exponential
            && self.decrease_type == WindowGrowthType::Exponential
    }

    pub fn grow(&self, current: u32) -> u32 {
        match self.increase_type {
            WindowGrowthType::Linear => current.saturating_add(self.increase_factor),
            WindowGrowthType::Exponential => {
                current.saturating_mul(self.increase_factor.max(1))
            }
        }
    }

    pub fn shrink(&self, current: u32) -> u32 {
        let shrunk = match self.decrease_type {
            WindowGrowthType::Linear => current.saturating_sub(self.decrease_factor),
            WindowGrowthType::Exponential => current / self.decrease_factor.max(1),
        };
        shrunk.max(self.floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(inc: WindowGrowthType, inc_f: u32, dec: WindowGrowthType, dec_f: u32) -> WindowPolicy {
        WindowPolicy {
            initial: 20,
            floor: 3,
            increase_type: inc,
            increase_factor: inc_f,
            decrease_type: dec,
            decrease_factor: dec_f,
        }
    }

    #[test]
    fn linear_growth_adds_factor() {
        let p = policy(WindowGrowthType::Linear, 5, WindowGrowthType::Linear, 2);
        assert_eq!(p.grow(20), 25);
    }

    #[test]
    fn exponential_growth_multiplies_factor() {
        let p = policy(WindowGrowthType::Exponential, 2, WindowGrowthType::Linear, 2);
        assert_eq!(p.grow(20), 40);
    }

    #[test]
    fn shrink_never_drops_below_floor() {
        let p = policy(WindowGrowthType::Linear, 5, WindowGrowthType::Exponential, 4);
        assert_eq!(p.shrink(10), 3);
    }

    #[test]
    fn factor_one_exponential_both_ways_is_static() {
        let p = policy(
            WindowGrowthType::Exponential,
            1,
            WindowGrowthType::Exponential,
            1,
        );
        assert!(p.is_static());
        assert_eq!(p.grow(20), 20);
        assert_eq!(p.shrink(20), 20);
    }

    #[test]
    fn linear_factor_one_is_not_static() {
        let p = policy(WindowGrowthType::Linear, 1, WindowGrowthType::Linear, 1);
        assert!(!p.is_static());
    }
}
