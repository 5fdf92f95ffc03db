//! Schéma déclaratif des champs gérés d'un profil.
//!
//! L'ordre de `FIELDS` est l'ordre canonique : le diff et le playbook
//! l'itèrent tel quel, jamais l'ordre d'insertion d'une map.

/// Une tâche de remédiation figée : nom, module exécuté côté hôte et arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTemplate {
    pub name: &'static str,
    pub module: &'static str,
    pub args: &'static [(&'static str, &'static str)],
}

/// Un champ connu du schéma avec sa valeur par défaut et ses deux tâches.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Valeur prise quand le champ est absent d'une state map
    pub baseline: bool,
    pub enable: TaskTemplate,
    pub disable: TaskTemplate,
}

impl FieldSpec {
    pub fn template_for(&self, value: bool) -> &TaskTemplate {
        if value {
            &self.enable
        } else {
            &self.disable
        }
    }
}

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "insights",
        baseline: false,
        enable: TaskTemplate {
            name: "Register host with Insights",
            module: "ansible.builtin.command",
            args: &[
                ("cmd", "insights-client --register"),
                ("creates", "/etc/insights-client/.registered"),
            ],
        },
        disable: TaskTemplate {
            name: "Unregister host from Insights",
            module: "ansible.builtin.command",
            args: &[
                ("cmd", "insights-client --unregister"),
                ("removes", "/etc/insights-client/.registered"),
            ],
        },
    },
    FieldSpec {
        name: "remediations",
        baseline: false,
        enable: TaskTemplate {
            name: "Enable remote remediations",
            module: "ansible.builtin.service",
            args: &[("enabled", "true"), ("name", "rhcd"), ("state", "started")],
        },
        disable: TaskTemplate {
            name: "Disable remote remediations",
            module: "ansible.builtin.service",
            args: &[("enabled", "false"), ("name", "rhcd"), ("state", "stopped")],
        },
    },
    FieldSpec {
        name: "compliance",
        baseline: false,
        enable: TaskTemplate {
            name: "Install compliance scanning tools",
            module: "ansible.builtin.dnf",
            args: &[("name", "openscap-scanner,scap-security-guide"), ("state", "present")],
        },
        disable: TaskTemplate {
            name: "Remove compliance scanning tools",
            module: "ansible.builtin.dnf",
            args: &[("name", "openscap-scanner,scap-security-guide"), ("state", "absent")],
        },
    },
];

pub fn lookup(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|f| f.name == name)
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn field_names_are_unique() {
        let names: HashSet<_> = FIELDS.iter().map(|f| f.name).collect();
        assert_eq!(names.len(), FIELDS.len());
    }

    #[test]
    fn lookup_finds_known_fields_only() {
        assert_eq!(lookup("remediations").map(|f| f.name), Some("remediations"));
        assert!(is_known("insights"));
        assert!(!is_known("active"));
        assert!(lookup("telemetry").is_none());
    }

    #[test]
    fn template_follows_target_value() {
        let field = lookup("remediations").unwrap();
        assert_eq!(field.template_for(true).name, "Enable remote remediations");
        assert_eq!(field.template_for(false).name, "Disable remote remediations");
    }
}
