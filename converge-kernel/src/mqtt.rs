/**
 * TRANSPORT MQTT - Événements d'inventaire, envoi des playbooks, retour des acks
 *
 * TOPICS :
 * - converge/inventory/events@v1   (entrant, `$share/<group>/` entre instances)
 * - converge/dispatch/ack@v1       (entrant, `$share/<group>/`)
 * - converge/hosts/<host_id>/playbook@v1 (sortant, un topic par hôte)
 *
 * FONCTIONNEMENT :
 * - QoS 1 avec acks manuels : un événement d'inventaire est acquitté au broker
 *   une fois traité, ou abandonné après quelques essais locaux (pas de
 *   redélivrance sans reconnexion en MQTT 3.1.1)
 * - La file de requêtes du client n'est vidée que par `poll` : aucune tâche ne
 *   fait d'await sur le client. Publications, acks et subscribes passent par les
 *   variantes `try_*`, une file pleine devient une erreur d'envoi transitoire
 */

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MqttConf;
use crate::dispatch::{DispatchHandle, DispatchTarget, PlaybookSender, SendError};
use crate::health::HealthTracker;
use crate::inventory::InventoryConsumer;
use crate::playbook::{Playbook, CONTENT_TYPE};

pub const INVENTORY_TOPIC: &str = "converge/inventory/events@v1";
pub const ACK_TOPIC: &str = "converge/dispatch/ack@v1";

/// Capacité de la file de requêtes du client et des channels internes
const CHANNEL_CAPACITY: usize = 64;

/// Essais locaux d'un événement d'inventaire avant abandon
const HANDLE_ATTEMPTS: u32 = 4;
const HANDLE_BACKOFF: Duration = Duration::from_millis(250);

pub fn playbook_topic(host_id: &str) -> String {
    format!("converge/hosts/{host_id}/playbook@v1")
}

pub fn shared_topic(group: &str, topic: &str) -> String {
    format!("$share/{group}/{topic}")
}

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    opts.set_manual_acks(true);
    // session persistante : les messages non acquittés reviennent après reconnexion
    opts.set_clean_session(false);
    AsyncClient::new(opts, CHANNEL_CAPACITY)
}

/// Enveloppe publiée vers l'hôte
#[derive(Debug, Serialize)]
pub struct PlaybookEnvelope<'a> {
    pub correlation_id: Uuid,
    pub host_id: &'a str,
    pub org_id: &'a str,
    pub profile_id: Uuid,
    pub content_type: &'static str,
    pub playbook: String,
}

#[derive(Clone)]
pub struct MqttPlaybookSender {
    client: AsyncClient,
}

impl MqttPlaybookSender {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaybookSender for MqttPlaybookSender {
    async fn send(&self, target: &DispatchTarget, playbook: &Playbook) -> Result<DispatchHandle, SendError> {
        let rendered = playbook
            .render()
            .map_err(|e| SendError::Permanent(e.to_string()))?;
        let envelope = PlaybookEnvelope {
            correlation_id: target.correlation_id,
            host_id: &target.host_id,
            org_id: &target.org_id,
            profile_id: target.profile_id,
            content_type: CONTENT_TYPE,
            playbook: rendered,
        };
        let payload = serde_json::to_vec(&envelope).map_err(|e| SendError::Permanent(e.to_string()))?;

        let topic = playbook_topic(&target.host_id);
        self.client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|e| SendError::Transient(e.to_string()))?;
        debug!(%topic, correlation_id = %target.correlation_id, "playbook published");
        Ok(DispatchHandle(format!("{topic}#{}", target.correlation_id)))
    }
}

/// Traite les événements d'inventaire un par un puis les acquitte au broker
fn spawn_inventory_worker(
    client: AsyncClient,
    consumer: InventoryConsumer,
    mut rx: mpsc::Receiver<Publish>,
) -> JoinHandle<()> {
    task::spawn(async move {
        while let Some(publish) = rx.recv().await {
            let outcome = consumer
                .handle_with_retry(&publish.payload, HANDLE_ATTEMPTS, HANDLE_BACKOFF)
                .await;
            debug!(?outcome, "inventory event consumed");
            if let Err(e) = client.try_ack(&publish) {
                warn!(error = %e, "failed to ack inventory event");
            }
        }
        debug!("inventory channel closed");
    })
}

pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    cfg: MqttConf,
    consumer: InventoryConsumer,
    ack_tx: mpsc::Sender<Vec<u8>>,
    health: HealthTracker,
) -> JoinHandle<()> {
    let (inventory_tx, inventory_rx) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_inventory_worker(client.clone(), consumer, inventory_rx);

    task::spawn(async move {
        let inventory_sub = shared_topic(&cfg.share_group, INVENTORY_TOPIC);
        let ack_sub = shared_topic(&cfg.share_group, ACK_TOPIC);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    info!(host = %cfg.host, port = cfg.port, "connected to MQTT broker");
                    for topic in [&inventory_sub, &ack_sub] {
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            error!(%topic, error = %e, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == INVENTORY_TOPIC => {
                    if inventory_tx.send(publish).await.is_err() {
                        error!("inventory worker stopped, leaving MQTT loop");
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == ACK_TOPIC => {
                    if ack_tx.send(publish.payload.to_vec()).await.is_err() {
                        error!("ack loop stopped, leaving MQTT loop");
                        return;
                    }
                    // l'ack est rejouable (correlation_id), on l'acquitte tout de suite
                    if let Err(e) = client.try_ack(&publish) {
                        warn!(error = %e, "failed to ack dispatch acknowledgement");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, "ignoring publish on unexpected topic");
                    let _ = client.try_ack(&publish);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    health.mark_mqtt_disconnected();
                    warn!("broker closed the MQTT session");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, reconnecting");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
