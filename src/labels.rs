//! Human-readable state labels derived from emission probabilities.
//!
//! Labels are a reporting aid only. They are computed after the fit and
//! never feed back into the parameters or the decoded states.

use crate::data::Variable;
use crate::model::HmmParams;
use std::collections::HashSet;

/// Probability above which a level counts as characteristic of a state.
const THRESHOLD: f64 = 0.5;

/// P(second level | state) for each observed variable: P(Yes) for the
/// usage variables, P(Stayed) for retention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmissionProfile {
    pub online_prior: f64,
    pub billpay_prior: f64,
    pub online_current: f64,
    pub billpay_current: f64,
    pub retained: f64,
}

impl EmissionProfile {
    /// Read the profile of one state from fitted parameters.
    pub fn from_params(params: &HmmParams, state: usize) -> Self {
        Self {
            online_prior: params.prob_of(state, Variable::OnlinePrior, 1),
            billpay_prior: params.prob_of(state, Variable::BillpayPrior, 1),
            online_current: params.prob_of(state, Variable::OnlineCurrent, 1),
            billpay_current: params.prob_of(state, Variable::BillpayCurrent, 1),
            retained: params.prob_of(state, Variable::Retained, 1),
        }
    }
}

/// Label for a single state, before collision handling.
pub fn describe_state(profile: &EmissionProfile) -> String {
    let retained = profile.retained > THRESHOLD;
    let prior_online = profile.online_prior > THRESHOLD;
    let current_online = profile.online_current > THRESHOLD;

    let retention = if retained { "Retained" } else { "Non-Retained" };
    let online = match (prior_online, current_online) {
        (true, true) => "Online",
        (false, false) => "Offline",
        (false, true) if retained => "Newly Online",
        (false, true) => "Adopted Online",
        (true, false) => "Dropped Online",
    };
    let billpay = if profile.billpay_prior > THRESHOLD || profile.billpay_current > THRESHOLD {
        "+Billpay"
    } else {
        ""
    };

    [retention, online, billpay].join(" ").trim().to_string()
}

/// Make labels distinct: if any two collide, every label gets its state
/// index appended, not just the colliding ones.
pub fn resolve_collisions(labels: Vec<String>) -> Vec<String> {
    let distinct: HashSet<&str> = labels.iter().map(String::as_str).collect();
    if distinct.len() == labels.len() {
        return labels;
    }
    labels
        .into_iter()
        .enumerate()
        .map(|(state, label)| format!("{label} {state}"))
        .collect()
}

/// Labels for every state of a fitted model, indexed by state.
pub fn label_states(params: &HmmParams) -> Vec<String> {
    let labels = (0..params.num_states())
        .map(|state| describe_state(&EmissionProfile::from_params(params, state)))
        .collect();
    resolve_collisions(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NUM_CATEGORIES, NUM_STATES};
    use ndarray::{Array1, Array2, Array3};
    use proptest::prelude::*;

    fn profile(retained: f64, online: (f64, f64), billpay: (f64, f64)) -> EmissionProfile {
        EmissionProfile {
            online_prior: online.0,
            billpay_prior: billpay.0,
            online_current: online.1,
            billpay_current: billpay.1,
            retained,
        }
    }

    fn params_from_profiles(profiles: &[EmissionProfile]) -> HmmParams {
        let n = profiles.len();
        let mut emissions = Array3::zeros((n, Variable::COUNT, NUM_CATEGORIES));
        for (state, p) in profiles.iter().enumerate() {
            let yes = [
                p.online_prior,
                p.billpay_prior,
                p.online_current,
                p.billpay_current,
                p.retained,
            ];
            for (v, &prob) in yes.iter().enumerate() {
                emissions[[state, v, 0]] = 1.0 - prob;
                emissions[[state, v, 1]] = prob;
            }
        }
        HmmParams::new(
            Array1::from_elem(n, 1.0 / n as f64),
            Array2::from_elem((n, n), 1.0 / n as f64),
            emissions,
        )
        .unwrap()
    }

    #[test]
    fn test_retained_newly_online_with_billpay() {
        let p = profile(0.9, (0.1, 0.8), (0.05, 0.6));
        assert_eq!(describe_state(&p), "Retained Newly Online +Billpay");
    }

    #[test]
    fn test_non_retained_offline() {
        let p = profile(0.2, (0.1, 0.1), (0.1, 0.1));
        assert_eq!(describe_state(&p), "Non-Retained Offline");
    }

    #[test]
    fn test_online_trajectories() {
        assert_eq!(describe_state(&profile(0.9, (0.8, 0.9), (0.1, 0.1))), "Retained Online");
        assert_eq!(describe_state(&profile(0.9, (0.1, 0.7), (0.1, 0.1))), "Retained Newly Online");
        assert_eq!(
            describe_state(&profile(0.3, (0.1, 0.7), (0.1, 0.1))),
            "Non-Retained Adopted Online"
        );
        assert_eq!(
            describe_state(&profile(0.3, (0.7, 0.2), (0.9, 0.1))),
            "Non-Retained Dropped Online +Billpay"
        );
    }

    #[test]
    fn test_threshold_is_strict() {
        assert_eq!(describe_state(&profile(0.5, (0.5, 0.5), (0.5, 0.5))), "Non-Retained Offline");
    }

    #[test]
    fn test_distinct_labels_untouched() {
        let params = params_from_profiles(&[
            profile(0.9, (0.9, 0.9), (0.9, 0.9)),
            profile(0.9, (0.1, 0.1), (0.1, 0.1)),
            profile(0.1, (0.1, 0.1), (0.1, 0.1)),
            profile(0.1, (0.9, 0.1), (0.1, 0.1)),
        ]);
        assert_eq!(
            label_states(&params),
            vec![
                "Retained Online +Billpay",
                "Retained Offline",
                "Non-Retained Offline",
                "Non-Retained Dropped Online",
            ]
        );
    }

    #[test]
    fn test_collision_suffixes_every_label() {
        let params = params_from_profiles(&[
            profile(0.9, (0.9, 0.9), (0.1, 0.1)),
            profile(0.8, (0.7, 0.6), (0.2, 0.3)),
            profile(0.1, (0.1, 0.1), (0.1, 0.1)),
            profile(0.1, (0.9, 0.1), (0.1, 0.1)),
        ]);
        assert_eq!(
            label_states(&params),
            vec![
                "Retained Online 0",
                "Retained Online 1",
                "Non-Retained Offline 2",
                "Non-Retained Dropped Online 3",
            ]
        );
    }

    #[test]
    fn test_labeling_is_deterministic() {
        let params = params_from_profiles(&[
            profile(0.9, (0.1, 0.8), (0.05, 0.6)),
            profile(0.2, (0.1, 0.1), (0.1, 0.1)),
            profile(0.2, (0.1, 0.1), (0.1, 0.1)),
            profile(0.6, (0.6, 0.6), (0.6, 0.6)),
        ]);
        assert_eq!(label_states(&params), label_states(&params));
    }

    fn probability() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.1), Just(0.9), 0.0..=1.0]
    }

    fn arb_profile() -> impl Strategy<Value = EmissionProfile> {
        (probability(), probability(), probability(), probability(), probability()).prop_map(
            |(retained, op, oc, bp, bc)| profile(retained, (op, oc), (bp, bc)),
        )
    }

    proptest! {
        #[test]
        fn prop_labels_always_distinct(profiles in prop::collection::vec(arb_profile(), NUM_STATES)) {
            let params = params_from_profiles(&profiles);
            let raw: Vec<String> = profiles.iter().map(describe_state).collect();
            let labels = label_states(&params);

            let distinct: HashSet<&String> = labels.iter().collect();
            prop_assert_eq!(distinct.len(), NUM_STATES);

            let raw_distinct: HashSet<&String> = raw.iter().collect();
            if raw_distinct.len() < NUM_STATES {
                for (state, (label, base)) in labels.iter().zip(&raw).enumerate() {
                    prop_assert_eq!(label, &format!("{base} {state}"));
                }
            } else {
                prop_assert_eq!(labels, raw);
            }
        }
    }
}
