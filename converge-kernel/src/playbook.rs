/**
 * GÉNÉRATEUR DE PLAYBOOKS - Diff → document de remédiation exécutable par l'hôte
 *
 * RÔLE : Chaque transition du diff devient exactement une tâche, via la table
 * fixe champ → template du schéma. Fonction pure : même diff, mêmes octets.
 *
 * FORMAT : YAML (application/x-yaml), un seul play sur localhost avec become,
 * les variables de ciblage (org, profil, hôte) dans `vars`.
 */

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::schema;

pub const CONTENT_TYPE: &str = "application/x-yaml";

/// Métadonnées de ciblage embarquées dans le playbook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybookTarget {
    pub org_id: String,
    pub profile_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    /// Champ du profil à l'origine de la tâche
    pub field: String,
    pub module: String,
    pub args: BTreeMap<String, String>,
}

// Forme Ansible : `- name: ...` puis `<module>: {args}` puis `tags: [field]`
impl Serialize for Task {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry(&self.module, &self.args)?;
        map.serialize_entry("tags", &[&self.field])?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playbook {
    pub target: PlaybookTarget,
    pub tasks: Vec<Task>,
}

#[derive(Serialize)]
struct Play<'a> {
    name: String,
    hosts: &'static str,
    #[serde(rename = "become")]
    become_root: bool,
    vars: &'a PlaybookTarget,
    tasks: &'a [Task],
}

impl Playbook {
    /// Rendu YAML déterministe
    pub fn render(&self) -> Result<String> {
        let play = Play {
            name: format!("Apply configuration profile {}", self.target.profile_id),
            hosts: "localhost",
            become_root: true,
            vars: &self.target,
            tasks: &self.tasks,
        };
        let body = serde_yaml::to_string(&[play])?;
        Ok(format!("# converge playbook for profile {}\n{body}", self.target.profile_id))
    }
}

/// Construit le playbook d'un diff non vide.
pub fn generate(diff: &Diff, target: PlaybookTarget) -> Result<Playbook> {
    if diff.is_empty() {
        return Err(Error::EmptyDiff);
    }

    let tasks = diff
        .transitions
        .iter()
        .map(|t| {
            let field = schema::lookup(&t.field).ok_or_else(|| Error::Schema(t.field.clone()))?;
            let template = field.template_for(t.to);
            Ok(Task {
                name: template.name.to_string(),
                field: field.name.to_string(),
                module: template.module.to_string(),
                args: template
                    .args
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Playbook { target, tasks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{diff, Transition};
    use crate::models::StateMap;

    fn target() -> PlaybookTarget {
        PlaybookTarget {
            org_id: "org-42".into(),
            profile_id: Uuid::parse_str("5b8f7c1e-2a3d-4e6f-8a9b-0c1d2e3f4a5b").unwrap(),
            host_id: Some("host-a".into()),
        }
    }

    fn full_diff() -> Diff {
        let to: StateMap = [("insights", true), ("remediations", true), ("compliance", true)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        diff(&StateMap::new(), &to)
    }

    #[test]
    fn empty_diff_is_rejected() {
        assert!(matches!(generate(&Diff::default(), target()), Err(Error::EmptyDiff)));
    }

    #[test]
    fn one_task_per_transition_in_order() {
        let playbook = generate(&full_diff(), target()).unwrap();
        let fields: Vec<_> = playbook.tasks.iter().map(|t| t.field.as_str()).collect();
        assert_eq!(fields, vec!["insights", "remediations", "compliance"]);
        assert_eq!(playbook.tasks[1].module, "ansible.builtin.service");
        assert_eq!(playbook.tasks[1].args.get("state").map(String::as_str), Some("started"));
    }

    #[test]
    fn disabling_transition_uses_disable_template() {
        let d = Diff {
            transitions: vec![Transition { field: "insights".into(), from: true, to: false }],
        };
        let playbook = generate(&d, target()).unwrap();
        assert_eq!(playbook.tasks[0].name, "Unregister host from Insights");
    }

    #[test]
    fn unknown_field_is_a_schema_error() {
        let d = Diff {
            transitions: vec![Transition { field: "telemetry".into(), from: false, to: true }],
        };
        match generate(&d, target()) {
            Err(Error::Schema(field)) => assert_eq!(field, "telemetry"),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn rendering_is_byte_identical() {
        let first = generate(&full_diff(), target()).unwrap().render().unwrap();
        let second = generate(&full_diff(), target()).unwrap().render().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rendered_yaml_carries_targeting_and_tasks() {
        let yaml = generate(&full_diff(), target()).unwrap().render().unwrap();
        assert!(yaml.starts_with("# converge playbook"));
        assert!(yaml.contains("hosts: localhost"));
        assert!(yaml.contains("become: true"));
        assert!(yaml.contains("host_id: host-a"));
        assert!(yaml.contains("ansible.builtin.dnf:"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let tasks = parsed[0]["tasks"].as_sequence().unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0]["tags"][0].as_str(), Some("insights"));
    }
}
