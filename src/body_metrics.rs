//! Body-composition metrics derived from weight, impedance and the user profile.
//!
//! Every metric is a pure function of its direct dependencies and is `None`
//! whenever one of them is missing, so a reading without impedance still
//! yields BMI and the weight/BMI scores while the fat-derived values drop out.
//! [`BodyMetrics::compute`] evaluates the whole cascade once, bottom-up.

use crate::types::Sex;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

/// Score bands for metabolic age: the adjustment is the number of
/// thresholds the health score has reached.
const METABOLIC_AGE_BANDS: [i32; 16] = [
    50, 60, 65, 68, 70, 73, 75, 80, 85, 88, 90, 93, 95, 97, 98, 99,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricInputs {
    pub weight_kg: Option<f64>,
    pub height_m: f64,
    pub age: i32,
    pub sex: Sex,
    pub impedance_ohm: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BodyMetrics {
    pub body_mass_index: Option<f64>,
    pub body_fat_percentage: Option<f64>,
    pub fat_free_weight: Option<f64>,
    pub subcutaneous_fat_percentage: Option<f64>,
    pub visceral_fat_value: Option<i32>,
    pub body_water_percentage: Option<f64>,
    pub basal_metabolic_rate: Option<i32>,
    pub skeletal_muscle_percentage: Option<f64>,
    pub muscle_mass: Option<f64>,
    pub bone_mass: Option<f64>,
    pub protein_percentage: Option<f64>,
    pub weight_score: Option<i32>,
    pub fat_score: Option<i32>,
    pub bmi_score: Option<i32>,
    pub health_score: Option<i32>,
    pub metabolic_age: Option<i32>,
}

impl BodyMetrics {
    pub fn compute(inputs: &MetricInputs) -> Self {
        let sex = inputs.sex.index();
        let weight = inputs.weight_kg;
        let impedance = inputs.impedance_ohm.filter(|&z| z != 0);

        let bmi = body_mass_index(weight, inputs.height_m);
        let bfp = body_fat_percentage(bmi, impedance, inputs.age, sex);
        let ffw = fat_free_weight(weight, bfp);
        let vfv = visceral_fat_value(weight, bmi, bfp, ffw, sex);
        let weight_score = weight.map(|w| weight_score(w, inputs.height_m, sex));
        let fat_score = bfp.map(|bfp| fat_score(bfp, sex));
        let bmi_score = bmi.map(bmi_score);
        let health_score = health_score(weight_score, fat_score, bmi_score);
        let body_water = body_water_percentage(weight, ffw, sex);
        let bone_mass = ffw.map(|ffw| bone_mass(ffw, sex));

        let metrics = BodyMetrics {
            body_mass_index: bmi,
            body_fat_percentage: bfp,
            fat_free_weight: ffw,
            subcutaneous_fat_percentage: subcutaneous_fat_percentage(bfp, vfv, sex),
            visceral_fat_value: vfv,
            body_water_percentage: body_water,
            basal_metabolic_rate: ffw.map(basal_metabolic_rate),
            skeletal_muscle_percentage: skeletal_muscle_percentage(weight, ffw, sex),
            muscle_mass: ffw.map(|ffw| muscle_mass(ffw, sex)),
            bone_mass,
            protein_percentage: protein_percentage(weight, bfp, body_water, bone_mass, sex),
            weight_score,
            fat_score,
            bmi_score,
            health_score,
            metabolic_age: health_score.map(|hs| metabolic_age(hs, inputs.age)),
        };

        debug!("Computed body metrics: {:?}", metrics);
        metrics
    }

    /// Present metrics as `(name, value)` pairs; absent ones are skipped
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        let int = |v: Option<i32>| v.map(f64::from);
        [
            ("body_mass_index", self.body_mass_index),
            ("body_fat_percentage", self.body_fat_percentage),
            ("fat_free_weight", self.fat_free_weight),
            ("subcutaneous_fat_percentage", self.subcutaneous_fat_percentage),
            ("visceral_fat_value", int(self.visceral_fat_value)),
            ("body_water_percentage", self.body_water_percentage),
            ("basal_metabolic_rate", int(self.basal_metabolic_rate)),
            ("skeletal_muscle_percentage", self.skeletal_muscle_percentage),
            ("muscle_mass", self.muscle_mass),
            ("bone_mass", self.bone_mass),
            ("protein_percentage", self.protein_percentage),
            ("weight_score", int(self.weight_score)),
            ("fat_score", int(self.fat_score)),
            ("bmi_score", int(self.bmi_score)),
            ("health_score", int(self.health_score)),
            ("metabolic_age", int(self.metabolic_age)),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.filter(|v| v.is_finite()).map(|v| (name, v)))
        .collect()
    }

    pub fn merge_into(&self, measurements: &mut BTreeMap<String, f64>) {
        for (name, value) in self.entries() {
            measurements.insert(name.to_string(), value);
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn floor_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).floor() / factor
}

fn body_mass_index(weight: Option<f64>, height_m: f64) -> Option<f64> {
    let weight = weight?;
    Some(floor_to(weight / (height_m * height_m), 2))
}

fn body_fat_percentage(
    bmi: Option<f64>,
    impedance: Option<u16>,
    age: i32,
    sex: usize,
) -> Option<f64> {
    const AGE_FACTOR: [f64; 2] = [0.103, 0.097];
    const BMI_FACTOR: [f64; 2] = [1.524, 1.545];
    const CONSTANT: [f64; 2] = [22.0, 12.7];

    let bmi = bmi?;
    let impedance = f64::from(impedance?);
    let raw = AGE_FACTOR[sex] * f64::from(age) + BMI_FACTOR[sex] * bmi
        - 500.0 / impedance
        - CONSTANT[sex];
    let bfp = floor_to(raw, 1);
    Some(bfp.clamp(5.0, 75.0))
}

fn fat_free_weight(weight: Option<f64>, bfp: Option<f64>) -> Option<f64> {
    Some(round_to(weight? * (1.0 - bfp? / 100.0), 2))
}

fn visceral_fat_value(
    weight: Option<f64>,
    bmi: Option<f64>,
    bfp: Option<f64>,
    ffw: Option<f64>,
    sex: usize,
) -> Option<i32> {
    const BMI_FACTOR: [f64; 2] = [0.8666, 0.8895];
    const BFP_FACTOR: [f64; 2] = [0.0082, 0.0943];
    const FAT_FACTOR: [f64; 2] = [0.026, -0.0534];
    const CONSTANT: [f64; 2] = [14.2692, 16.215];

    let vfv = BMI_FACTOR[sex] * bmi? + BFP_FACTOR[sex] * bfp? + FAT_FACTOR[sex] * (weight? - ffw?)
        - CONSTANT[sex];
    Some((vfv.trunc() as i32).clamp(1, 30))
}

fn subcutaneous_fat_percentage(bfp: Option<f64>, vfv: Option<i32>, sex: usize) -> Option<f64> {
    const BFP_FACTOR: [f64; 2] = [0.965, 0.983];
    const VFV_FACTOR: [f64; 2] = [0.22, 0.303];

    Some(round_to(BFP_FACTOR[sex] * bfp? - VFV_FACTOR[sex] * f64::from(vfv?), 1))
}

/// Fat-free weight share not attributed to bone
fn lean_remainder(ffw: f64, sex: usize) -> f64 {
    const FFW_FACTOR: [f64; 2] = [0.05, 0.06];
    ffw - (FFW_FACTOR[sex] * ffw).max(1.0)
}

fn body_water_percentage(weight: Option<f64>, ffw: Option<f64>, sex: usize) -> Option<f64> {
    const WATER_FACTOR: [f64; 2] = [0.76, 0.73];

    let bwp = round_to(WATER_FACTOR[sex] * lean_remainder(ffw?, sex) / weight? * 100.0, 1);
    Some(bwp.clamp(10.0, 80.0))
}

fn basal_metabolic_rate(ffw: f64) -> i32 {
    ((ffw * 21.6 + 370.0).trunc() as i32).clamp(900, 2500)
}

fn skeletal_muscle_percentage(weight: Option<f64>, ffw: Option<f64>, sex: usize) -> Option<f64> {
    const MUSCLE_FACTOR: [f64; 2] = [0.68, 0.62];

    Some(round_to(MUSCLE_FACTOR[sex] * lean_remainder(ffw?, sex) / weight? * 100.0, 1))
}

fn muscle_mass(ffw: f64, sex: usize) -> f64 {
    round_to(lean_remainder(ffw, sex), 2)
}

fn bone_mass(ffw: f64, sex: usize) -> f64 {
    const FFW_FACTOR: [f64; 2] = [0.05, 0.06];
    round_to(FFW_FACTOR[sex] * ffw, 2).max(1.0)
}

fn protein_percentage(
    weight: Option<f64>,
    bfp: Option<f64>,
    body_water: Option<f64>,
    bone_mass: Option<f64>,
    sex: usize,
) -> Option<f64> {
    const BFP_FACTOR: [f64; 2] = [1.0, 1.05];

    let protein = round_to(
        100.0 - BFP_FACTOR[sex] * bfp? - bone_mass? / weight? * 100.0 - body_water?,
        1,
    );
    Some(protein.max(5.0))
}

fn weight_score(weight: f64, height_m: f64, sex: usize) -> i32 {
    const HEIGHT_FACTOR: [f64; 2] = [100.0, 137.0];
    const CONSTANT: [f64; 2] = [80.0, 110.0];
    const FACTOR: [f64; 2] = [0.7, 0.45];

    let ideal = FACTOR[sex] * (HEIGHT_FACTOR[sex] * height_m - CONSTANT[sex]);
    if ideal <= weight {
        if ideal * 1.3 < weight {
            return 50;
        }
        return (100.0 - 50.0 * (weight - ideal) / (0.3 * ideal)) as i32;
    }
    if ideal * 0.7 < weight {
        return (100.0 - 50.0 * (ideal - weight) / (0.3 * ideal)) as i32;
    }
    (0..6)
        .find(|&x| ideal * f64::from(x) / 10.0 > weight)
        .map_or(0, |x| x * 10)
}

fn fat_score(bfp: f64, sex: usize) -> i32 {
    const CONSTANT: [f64; 2] = [16.0, 26.0];

    let ideal = CONSTANT[sex];
    if ideal < bfp {
        if bfp >= 45.0 {
            return 50;
        }
        return (100.0 - 50.0 * (bfp - ideal) / (45.0 - ideal)) as i32;
    }
    (100.0 - 50.0 * (ideal - bfp) / (ideal - 5.0)) as i32
}

fn bmi_score(bmi: f64) -> i32 {
    if bmi >= 22.0 {
        if bmi >= 35.0 {
            return 50;
        }
        return (100.0 - 3.85 * (bmi - 22.0)) as i32;
    }
    if bmi >= 15.0 {
        return (100.0 - 3.85 * (22.0 - bmi)) as i32;
    }
    if bmi >= 10.0 {
        40
    } else if bmi >= 5.0 {
        30
    } else {
        20
    }
}

fn health_score(
    weight_score: Option<i32>,
    fat_score: Option<i32>,
    bmi_score: Option<i32>,
) -> Option<i32> {
    Some((weight_score? + fat_score? + bmi_score?).div_euclid(3))
}

fn metabolic_age(health_score: i32, age: i32) -> i32 {
    let adjustment = METABOLIC_AGE_BANDS
        .iter()
        .take_while(|&&threshold| health_score >= threshold)
        .count() as i32;
    (age + 8 - adjustment).max(18)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(weight_kg: Option<f64>, impedance_ohm: Option<u16>, sex: Sex) -> MetricInputs {
        MetricInputs {
            weight_kg,
            height_m: 1.75,
            age: 30,
            sex,
            impedance_ohm,
        }
    }

    #[test]
    fn test_missing_weight_yields_nothing() {
        let metrics = BodyMetrics::compute(&inputs(None, Some(500), Sex::Male));
        assert_eq!(metrics, BodyMetrics::default());
        assert!(metrics.entries().is_empty());
    }

    #[test]
    fn test_full_cascade_male() {
        let metrics = BodyMetrics::compute(&inputs(Some(70.0), Some(500), Sex::Male));
        let entries = metrics.entries();
        assert_eq!(entries.len(), 16);

        assert_eq!(metrics.body_mass_index, Some(22.85));
        assert_eq!(metrics.body_fat_percentage, Some(14.9));
        assert_eq!(metrics.fat_free_weight, Some(59.57));

        let bfp = metrics.body_fat_percentage.unwrap();
        assert!((5.0..=75.0).contains(&bfp));
        let vfv = metrics.visceral_fat_value.unwrap();
        assert!((1..=30).contains(&vfv));
        let bmr = metrics.basal_metabolic_rate.unwrap();
        assert!((900..=2500).contains(&bmr));
        assert!(metrics.bone_mass.unwrap() >= 1.0);
        assert!(metrics.protein_percentage.unwrap() >= 5.0);
        let water = metrics.body_water_percentage.unwrap();
        assert!((10.0..=80.0).contains(&water));
        assert!(metrics.metabolic_age.unwrap() >= 18);
        let health = metrics.health_score.unwrap();
        assert!((0..=100).contains(&health));
    }

    #[test]
    fn test_full_cascade_female() {
        let metrics = BodyMetrics::compute(&MetricInputs {
            weight_kg: Some(58.0),
            height_m: 1.64,
            age: 41,
            sex: Sex::Female,
            impedance_ohm: Some(620),
        });
        assert_eq!(metrics.entries().len(), 16);
        assert!(metrics.bone_mass.unwrap() >= 1.0);
    }

    #[test]
    fn test_without_impedance_only_weight_metrics() {
        let metrics = BodyMetrics::compute(&inputs(Some(70.0), None, Sex::Male));
        assert!(metrics.body_mass_index.is_some());
        assert!(metrics.weight_score.is_some());
        assert!(metrics.bmi_score.is_some());
        assert_eq!(metrics.body_fat_percentage, None);
        assert_eq!(metrics.fat_free_weight, None);
        assert_eq!(metrics.fat_score, None);
        assert_eq!(metrics.health_score, None);
        assert_eq!(metrics.metabolic_age, None);
        assert_eq!(metrics.entries().len(), 3);
    }

    #[test]
    fn test_zero_impedance_is_treated_as_missing() {
        let metrics = BodyMetrics::compute(&inputs(Some(70.0), Some(0), Sex::Male));
        assert_eq!(metrics.body_fat_percentage, None);
    }

    #[test]
    fn test_body_fat_is_clamped() {
        let lean = BodyMetrics::compute(&MetricInputs {
            weight_kg: Some(45.0),
            height_m: 1.90,
            age: 18,
            sex: Sex::Male,
            impedance_ohm: Some(50),
        });
        assert_eq!(lean.body_fat_percentage, Some(5.0));
    }

    #[test]
    fn test_bmi_score_bands() {
        assert_eq!(bmi_score(40.0), 50);
        assert_eq!(bmi_score(22.0), 100);
        assert_eq!(bmi_score(12.0), 40);
        assert_eq!(bmi_score(7.0), 30);
        assert_eq!(bmi_score(3.0), 20);
    }

    #[test]
    fn test_metabolic_age_bands() {
        assert_eq!(metabolic_age(40, 30), 38);
        assert_eq!(metabolic_age(50, 30), 37);
        assert_eq!(metabolic_age(98, 30), 23);
        assert_eq!(metabolic_age(100, 30), 22);
        assert_eq!(metabolic_age(100, 12), 18);
    }

    #[test]
    fn test_merge_only_adds_present_values() {
        let metrics = BodyMetrics::compute(&inputs(Some(80.0), None, Sex::Female));
        let mut measurements = BTreeMap::new();
        measurements.insert("weight".to_string(), 80.0);
        metrics.merge_into(&mut measurements);

        assert!(measurements.contains_key("body_mass_index"));
        assert!(!measurements.contains_key("body_fat_percentage"));
        assert_eq!(measurements.len(), 4);
    }
}
