//! Diff entre deux state maps, champ par champ, dans l'ordre du schéma.

use serde::{Deserialize, Serialize};

use crate::models::StateMap;
use crate::schema::{self, FieldSpec};

/// Un champ qui change de valeur.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub field: String,
    pub from: bool,
    pub to: bool,
}

/// Suite ordonnée de transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub transitions: Vec<Transition>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Applique les transitions à une copie de `state`
    pub fn apply(&self, state: &StateMap) -> StateMap {
        let mut out = state.clone();
        for t in &self.transitions {
            out.insert(t.field.clone(), t.to);
        }
        out
    }
}

fn value_of(state: &StateMap, field: &FieldSpec) -> bool {
    state.get(field.name).copied().unwrap_or(field.baseline)
}

/// Calcule les transitions `from -> to` restreintes aux champs du schéma.
pub fn diff(from: &StateMap, to: &StateMap) -> Diff {
    let transitions = schema::FIELDS
        .iter()
        .filter_map(|field| {
            let (a, b) = (value_of(from, field), value_of(to, field));
            (a != b).then(|| Transition {
                field: field.name.to_string(),
                from: a,
                to: b,
            })
        })
        .collect();
    Diff { transitions }
}

/// Une transition par champ du schéma vers la valeur de `to`, quel que soit
/// l'état de départ : sert à décrire un état complet.
pub fn full_state(to: &StateMap) -> Diff {
    let transitions = schema::FIELDS
        .iter()
        .map(|field| {
            let value = value_of(to, field);
            Transition {
                field: field.name.to_string(),
                from: !value,
                to: value,
            }
        })
        .collect();
    Diff { transitions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::baseline_state;

    fn state(pairs: &[(&str, bool)]) -> StateMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn diff_with_itself_is_empty() {
        let samples = [
            StateMap::new(),
            baseline_state(),
            state(&[("insights", true), ("remediations", false)]),
            state(&[("compliance", true), ("unmanaged", true)]),
        ];
        for s in &samples {
            assert!(diff(s, s).is_empty());
        }
    }

    #[test]
    fn absent_field_uses_baseline() {
        let explicit = state(&[("insights", false), ("remediations", false), ("compliance", false)]);
        assert!(diff(&StateMap::new(), &explicit).is_empty());
    }

    #[test]
    fn single_field_change_yields_one_transition() {
        let from = state(&[("insights", true), ("remediations", false), ("compliance", true)]);
        let mut to = from.clone();
        to.insert("remediations".into(), true);

        let d = diff(&from, &to);
        assert_eq!(
            d.transitions,
            vec![Transition { field: "remediations".into(), from: false, to: true }]
        );
    }

    #[test]
    fn transitions_follow_schema_order_not_map_order() {
        // BTreeMap trie "compliance" < "insights" < "remediations" ;
        // le schéma déclare insights, remediations, compliance.
        let to = state(&[("compliance", true), ("insights", true), ("remediations", true)]);
        let fields: Vec<_> = diff(&StateMap::new(), &to)
            .transitions
            .into_iter()
            .map(|t| t.field)
            .collect();
        assert_eq!(fields, vec!["insights", "remediations", "compliance"]);
    }

    #[test]
    fn diff_is_deterministic() {
        let a = state(&[("insights", true)]);
        let b = state(&[("remediations", true), ("compliance", true)]);
        assert_eq!(diff(&a, &b), diff(&a, &b));
    }

    #[test]
    fn applying_diff_reaches_target_on_schema_fields() {
        let pairs = [
            (StateMap::new(), state(&[("insights", true), ("compliance", true)])),
            (state(&[("insights", true)]), state(&[("insights", false), ("remediations", true)])),
            (baseline_state(), baseline_state()),
        ];
        for (from, to) in pairs {
            let applied = diff(&from, &to).apply(&from);
            assert!(diff(&applied, &to).is_empty());
        }
    }

    #[test]
    fn unknown_keys_never_produce_transitions() {
        let from = state(&[("unmanaged", false)]);
        let to = state(&[("unmanaged", true)]);
        assert!(diff(&from, &to).is_empty());
    }

    #[test]
    fn full_state_covers_every_schema_field() {
        let to = state(&[("insights", false), ("remediations", true)]);
        let d = full_state(&to);
        let targets: Vec<_> = d.transitions.iter().map(|t| (t.field.as_str(), t.to)).collect();
        assert_eq!(
            targets,
            vec![("insights", false), ("remediations", true), ("compliance", false)]
        );
        assert!(d.transitions.iter().all(|t| t.from != t.to));
        assert!(diff(&d.apply(&StateMap::new()), &to).is_empty());
    }
}
