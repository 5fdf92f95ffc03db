/*!
# Converge DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests du kernel Converge sans broker ni base externe :
- Sender de playbooks enregistreur, scriptable pour simuler des pannes
- Builders d'événements d'inventaire et d'acks au format des topics
- Harness complet (store SQLite temporaire + coordinateur + consommateur)
*/

pub mod sender_stub;
pub mod event_builders;
pub mod test_utils;

pub use sender_stub::{RecordingSender, SentPlaybook};
pub use event_builders::{ack_payload, EventBuilder, EventInstance};
pub use test_utils::TestHarness;
