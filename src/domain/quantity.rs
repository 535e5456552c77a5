// ==========================================
// 仓库出库释放系统 - 数量精度工具
// ==========================================
// 职责: 按计量单位舍入步长处理数量
// 约束: 距零不足半个步长的数量视为零,重复计算结果不变
// ==========================================

use rust_decimal::{Decimal, RoundingStrategy};
use std::cmp::Ordering;

/// 向下舍入到计量单位步长
///
/// 释放数量必须向下取整,避免超额预留
pub fn round_down(qty: Decimal, rounding: Decimal) -> Decimal {
    if rounding <= Decimal::ZERO {
        return qty;
    }
    ((qty / rounding).floor() * rounding).normalize()
}

/// 四舍五入到计量单位步长
pub fn round_half_up(qty: Decimal, rounding: Decimal) -> Decimal {
    if rounding <= Decimal::ZERO {
        return qty;
    }
    ((qty / rounding).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * rounding)
        .normalize()
}

/// 在舍入容差内是否为零
pub fn is_zero(qty: Decimal, rounding: Decimal) -> bool {
    if rounding <= Decimal::ZERO {
        return qty.is_zero();
    }
    qty.abs() * Decimal::TWO < rounding
}

/// 在舍入容差内比较两个数量
pub fn compare(a: Decimal, b: Decimal, rounding: Decimal) -> Ordering {
    let delta = a - b;
    if is_zero(delta, rounding) {
        Ordering::Equal
    } else if delta > Decimal::ZERO {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// 限定在 [0, upper] 区间
pub fn clamp(qty: Decimal, upper: Decimal) -> Decimal {
    qty.max(Decimal::ZERO).min(upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_down() {
        assert_eq!(round_down(dec!(4.999), dec!(0.01)), dec!(4.99));
        assert_eq!(round_down(dec!(7), dec!(1)), dec!(7));
        assert_eq!(round_down(dec!(7.5), dec!(1)), dec!(7));
        assert_eq!(round_down(dec!(3.3), Decimal::ZERO), dec!(3.3));
    }

    #[test]
    fn test_is_zero_within_tolerance() {
        assert!(is_zero(dec!(0.004), dec!(0.01)));
        assert!(!is_zero(dec!(0.005), dec!(0.01)));
        assert!(is_zero(dec!(0), Decimal::ZERO));
        // 幂等: 对已舍入值再次判定结果不变
        let q = round_half_up(dec!(0.004), dec!(0.01));
        assert!(is_zero(q, dec!(0.01)));
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare(dec!(10), dec!(10.001), dec!(0.01)), Ordering::Equal);
        assert_eq!(compare(dec!(10), dec!(4), dec!(0.01)), Ordering::Greater);
        assert_eq!(compare(dec!(4), dec!(10), dec!(1)), Ordering::Less);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(dec!(-2), dec!(5)), dec!(0));
        assert_eq!(clamp(dec!(12), dec!(5)), dec!(5));
        assert_eq!(clamp(dec!(3), dec!(5)), dec!(3));
    }
}
