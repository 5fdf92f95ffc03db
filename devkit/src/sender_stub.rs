/*!
Sender de playbooks pour tests sans broker

Remplace `MqttPlaybookSender` : enregistre chaque envoi et rejoue une file
d'erreurs scriptées (pannes transitoires ou refus définitifs).
*/

use async_trait::async_trait;
use converge_kernel::dispatch::{DispatchHandle, DispatchTarget, PlaybookSender, SendError};
use converge_kernel::playbook::Playbook;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SentPlaybook {
    pub target: DispatchTarget,
    pub playbook: Playbook,
    pub yaml: String,
}

impl SentPlaybook {
    /// Champs du profil touchés, dans l'ordre des tâches
    pub fn fields(&self) -> Vec<String> {
        self.playbook.tasks.iter().map(|t| t.field.clone()).collect()
    }
}

#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<SentPlaybook>>>,
    script: Arc<Mutex<VecDeque<SendError>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Le prochain envoi échouera avec `err`
    pub fn fail_next(&self, err: SendError) {
        self.script.lock().push_back(err);
    }

    pub fn fail_transient(&self, times: usize) {
        let mut script = self.script.lock();
        for _ in 0..times {
            script.push_back(SendError::Transient("broker unavailable".into()));
        }
    }

    pub fn sent(&self) -> Vec<SentPlaybook> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, host_id: &str) -> Vec<SentPlaybook> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.target.host_id == host_id)
            .cloned()
            .collect()
    }

    pub fn last_to(&self, host_id: &str) -> Option<SentPlaybook> {
        self.sent_to(host_id).pop()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
        self.script.lock().clear();
    }
}

#[async_trait]
impl PlaybookSender for RecordingSender {
    async fn send(&self, target: &DispatchTarget, playbook: &Playbook) -> Result<DispatchHandle, SendError> {
        if let Some(err) = self.script.lock().pop_front() {
            tracing::debug!(host_id = %target.host_id, error = %err, "[stub] scripted send failure");
            return Err(err);
        }

        let yaml = playbook
            .render()
            .map_err(|e| SendError::Permanent(e.to_string()))?;
        let mut sent = self.sent.lock();
        sent.push(SentPlaybook {
            target: target.clone(),
            playbook: playbook.clone(),
            yaml,
        });
        tracing::debug!(host_id = %target.host_id, tasks = playbook.tasks.len(), "[stub] playbook recorded");
        Ok(DispatchHandle(format!("stub-{}", sent.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_kernel::diff::diff;
    use converge_kernel::models::{baseline_state, StateMap};
    use converge_kernel::playbook::{generate, PlaybookTarget};
    use uuid::Uuid;

    fn sample() -> (DispatchTarget, Playbook) {
        let mut to = StateMap::new();
        to.insert("insights".into(), true);
        let profile_id = Uuid::new_v4();
        let playbook = generate(
            &diff(&baseline_state(), &to),
            PlaybookTarget { org_id: "o".into(), profile_id, host_id: Some("h".into()) },
        )
        .unwrap();
        let target = DispatchTarget {
            host_id: "h".into(),
            org_id: "o".into(),
            profile_id,
            correlation_id: Uuid::new_v4(),
        };
        (target, playbook)
    }

    #[tokio::test]
    async fn records_sends_and_replays_script() {
        let sender = RecordingSender::new();
        let (target, playbook) = sample();

        sender.fail_next(SendError::Permanent("rejected".into()));
        assert_eq!(
            sender.send(&target, &playbook).await,
            Err(SendError::Permanent("rejected".into()))
        );
        assert_eq!(sender.count(), 0);

        let handle = sender.send(&target, &playbook).await.unwrap();
        assert_eq!(handle, DispatchHandle("stub-1".into()));
        assert_eq!(sender.last_to("h").unwrap().fields(), vec!["insights".to_string()]);
    }
}
