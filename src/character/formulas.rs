//! Deterministic skill and fitting math.
//!
//! Every component that needs a tax fraction, cargo volume, or travel time
//! calls into here, so the numbers agree across the whole response surface.

/// Diminishing-returns factor for the i-th strongest same-kind bonus.
pub fn stacking_penalty(index: usize) -> f64 {
    (-((index as f64) / 2.67).powi(2)).exp()
}

/// Combines same-kind multipliers with the stacking penalty applied in
/// descending order of effect magnitude.
pub fn stacked_multiplier(multipliers: &[f64]) -> f64 {
    let mut mods: Vec<f64> = multipliers.to_vec();
    mods.sort_by(|a, b| (b - 1.0).abs().total_cmp(&(a - 1.0).abs()));
    mods.iter()
        .enumerate()
        .map(|(i, m)| 1.0 + (m - 1.0) * stacking_penalty(i))
        .product()
}

/// Sales tax fraction of sell revenue. Accounting reduces the 8% base by
/// 11% per level, floored at 1%.
pub fn sales_tax_fraction(accounting: u8) -> f64 {
    (0.08 * (1.0 - 0.11 * accounting as f64)).max(0.01)
}

/// Broker fee fraction charged when listing an order. Skill reductions and
/// NPC standings both apply; the floor is 1%.
pub fn broker_fee_fraction(
    broker_relations: u8,
    advanced_broker_relations: u8,
    faction_standing: f64,
    corp_standing: f64,
) -> f64 {
    let skill_reduction = 1.0
        - 0.03 * broker_relations as f64 * 2.0
        - 0.03 * advanced_broker_relations as f64 * 2.0;
    (0.03 * skill_reduction - 0.0003 * faction_standing - 0.0002 * corp_standing).max(0.01)
}

/// Hold volume after hull skills, fitted expanders (stacking-penalized),
/// and flat additions.
pub fn effective_cargo_capacity(
    base_capacity: f64,
    racial_industrial: u8,
    freighter: u8,
    module_multipliers: &[f64],
    flat_additions_m3: f64,
) -> f64 {
    let hull_skill = 1.0 + 0.05 * racial_industrial.max(freighter) as f64;
    base_capacity * hull_skill * stacked_multiplier(module_multipliers) + flat_additions_m3
}

/// Warp velocity in AU/s. Rig multipliers stack without penalty.
pub fn effective_warp_speed(
    base_warp_speed: f64,
    warp_drive_operation: u8,
    navigation: u8,
    rig_multipliers: &[f64],
) -> f64 {
    base_warp_speed
        * (1.0 + 0.10 * warp_drive_operation as f64)
        * (1.0 + 0.05 * navigation as f64)
        * rig_multipliers.iter().product::<f64>()
}

/// Seconds to align for warp. The skill reduction shares one stacking
/// chain with fitted inertia modifiers.
pub fn align_time_seconds(
    mass_kg: f64,
    base_inertia_modifier: f64,
    evasive_maneuvering: u8,
    module_inertia_modifiers: &[f64],
) -> f64 {
    let mut mods = module_inertia_modifiers.to_vec();
    mods.push(1.0 - 0.05 * evasive_maneuvering as f64);
    let inertia = base_inertia_modifier * stacked_multiplier(&mods);
    std::f64::consts::LN_2 * inertia * mass_kg / 500_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sales_tax_scales_with_accounting() {
        assert!((sales_tax_fraction(0) - 0.08).abs() < 1e-12);
        assert!((sales_tax_fraction(5) - 0.036).abs() < 1e-12);
        // The floor holds even for out-of-range input.
        assert!(sales_tax_fraction(255) >= 0.01);
    }

    #[test]
    fn broker_fee_scales_and_floors() {
        assert!((broker_fee_fraction(0, 0, 0.0, 0.0) - 0.03).abs() < 1e-12);
        assert!((broker_fee_fraction(5, 5, 0.0, 0.0) - 0.012).abs() < 1e-12);
        // High standings push the raw value under the floor.
        assert_eq!(broker_fee_fraction(5, 5, 10.0, 10.0), 0.01);
    }

    #[test]
    fn stacking_penalty_decays() {
        assert_eq!(stacking_penalty(0), 1.0);
        let first = stacking_penalty(1);
        let second = stacking_penalty(2);
        assert!(first < 1.0 && second < first);
        assert!((first - 0.8691).abs() < 1e-3);
    }

    #[test]
    fn stacked_multiplier_orders_by_magnitude() {
        // Order in the slice must not matter.
        let a = stacked_multiplier(&[1.255, 1.15]);
        let b = stacked_multiplier(&[1.15, 1.255]);
        assert!((a - b).abs() < 1e-12);
        // Strongest bonus unpenalized, second reduced.
        let expected = 1.255 * (1.0 + 0.15 * stacking_penalty(1));
        assert!((a - expected).abs() < 1e-12);
    }

    #[test]
    fn cargo_capacity_applies_skills_modules_and_flat() {
        let capacity = effective_cargo_capacity(3900.0, 5, 0, &[1.255], 100.0);
        assert!((capacity - (3900.0 * 1.25 * 1.255 + 100.0)).abs() < 1e-9);
        // Freighter level substitutes when higher.
        let freighter = effective_cargo_capacity(3900.0, 0, 4, &[], 0.0);
        assert!((freighter - 3900.0 * 1.2).abs() < 1e-9);
    }

    #[test]
    fn warp_speed_stacks_rigs_freely() {
        let speed = effective_warp_speed(4.5, 5, 5, &[1.1, 1.1]);
        assert!((speed - 4.5 * 1.5 * 1.25 * 1.21).abs() < 1e-9);
    }

    #[test]
    fn align_time_shrinks_with_skill() {
        let untrained = align_time_seconds(13_500_000.0, 1.0, 0, &[]);
        let trained = align_time_seconds(13_500_000.0, 1.0, 5, &[]);
        assert!(trained < untrained);
        assert!((untrained - std::f64::consts::LN_2 * 27.0).abs() < 1e-9);
    }
}
