#![forbid(unsafe_code)]

// Signaling dispatcher - per-message handlers for a connection's state machine

use super::connections::{ConnectionInfo, ConnectionRegistry};
use super::error::{SignalingError, SignalingResult};
use super::protocol::{parse_client_message, ClientMessage, Inbound, ServerMessage};
use crate::media::config::WebRtcTransportConfig;
use crate::media::engine::MediaRouter;
use crate::media::types::{MediaRole, ProducerMeta, ProducerType, RouterCapabilities, TransportDirection};
use crate::metrics::ServiceMetrics;
use crate::room::{ConsumerEntry, Departure, Owner, ProducerEntry, RoomStore, StatePatch, TransportEntry};
use mediasoup::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Handles inbound messages for all connections.
///
/// Each connection must feed its own messages in arrival order, one at a
/// time (see [`InboundQueue`](super::queue::InboundQueue)); different
/// connections may dispatch concurrently.
pub struct Dispatcher {
    connections: Arc<ConnectionRegistry>,
    rooms: Arc<RoomStore>,
    transport_config: WebRtcTransportConfig,
    metrics: ServiceMetrics,
}

impl Dispatcher {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        rooms: Arc<RoomStore>,
        transport_config: WebRtcTransportConfig,
        metrics: ServiceMetrics,
    ) -> Self {
        Self {
            connections,
            rooms,
            transport_config,
            metrics,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn rooms(&self) -> &Arc<RoomStore> {
        &self.rooms
    }

    /// Parses and handles one raw frame. Failures are reported to this
    /// connection only.
    pub async fn dispatch(&self, connection_id: &str, raw: &str) {
        self.metrics.inc_messages_received();

        let message = match parse_client_message(raw) {
            Ok(Inbound::Message(message)) => message,
            Ok(Inbound::Unknown(tag)) => {
                warn!("Ignoring unknown message type '{}' from connection {}", tag, connection_id);
                return;
            }
            Err(e) => {
                warn!("Invalid message format from connection {}: {}", connection_id, e);
                self.report(connection_id, SignalingError::InvalidMessage(e.to_string()));
                return;
            }
        };

        let Some(conn) = self.connections.info(connection_id) else {
            debug!("Message for closed connection {} dropped", connection_id);
            return;
        };

        let name = message.name();
        debug!("Handling {} from user {} ({})", name, conn.user_id, connection_id);

        let start = Instant::now();
        let result = self.handle(&conn, *message).await;
        self.metrics.observe_message_handling(start.elapsed());

        if let Err(e) = result {
            error!("Error handling {} from user {}: {}", name, conn.user_id, e);
            self.report(connection_id, e);
        }
    }

    fn report(&self, connection_id: &str, e: SignalingError) {
        self.metrics.inc_errors();
        self.connections.send(
            connection_id,
            &ServerMessage::Error {
                message: e.to_string(),
                code: Some(e.code().to_string()),
            },
        );
    }

    async fn handle(&self, conn: &ConnectionInfo, message: ClientMessage) -> SignalingResult<()> {
        match message {
            ClientMessage::Join {
                channel_id,
                rtp_capabilities,
            } => self.join(conn, channel_id, rtp_capabilities).await,
            ClientMessage::Leave { channel_id } => self.leave(conn, channel_id).await,
            ClientMessage::CreateTransport { direction } => self.create_transport(conn, direction).await,
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(conn, &transport_id, dtls_parameters).await,
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                producer_type,
            } => self.produce(conn, &transport_id, kind, rtp_parameters, producer_type).await,
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => self.consume(conn, &producer_id, rtp_capabilities).await,
            ClientMessage::UpdateState {
                muted,
                deafened,
                video_enabled,
            } => {
                let patch = StatePatch {
                    muted,
                    deafened,
                    video_enabled,
                };
                self.update_state(conn, patch).await
            }
            ClientMessage::ResumeConsumer { consumer_id } => self.resume_consumer(conn, &consumer_id).await,
        }
    }

    fn joined_channel(conn: &ConnectionInfo) -> SignalingResult<&str> {
        conn.channel_id.as_deref().ok_or(SignalingError::NotJoined)
    }

    fn owner(conn: &ConnectionInfo, channel_id: &str) -> Owner {
        Owner {
            user_id: conn.user_id.clone(),
            channel_id: channel_id.to_string(),
            connection_id: conn.connection_id.clone(),
        }
    }

    async fn join(
        &self,
        conn: &ConnectionInfo,
        channel_id: String,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> SignalingResult<()> {
        if let Some(current) = &conn.channel_id {
            return Err(SignalingError::AlreadyJoined(current.clone()));
        }

        let (router, _) = self
            .rooms
            .join_room(&channel_id, &conn.user_id, &conn.connection_id)
            .await?;
        self.connections
            .set_channel(&conn.connection_id, &channel_id, rtp_capabilities);
        self.metrics.inc_joins();
        info!("User {} joined channel {}", conn.user_id, channel_id);

        self.connections.send(
            &conn.connection_id,
            &ServerMessage::RouterCapabilities {
                rtp_capabilities: RouterCapabilities::Negotiated(router.rtp_capabilities()),
            },
        );
        self.connections.broadcast_to_channel(
            &channel_id,
            &ServerMessage::UserJoined {
                user_id: conn.user_id.clone(),
            },
            Some(&conn.user_id),
        );

        for participant in self.rooms.get_participants(&channel_id).await? {
            if participant.user_id == conn.user_id {
                continue;
            }
            for (role, producer_id) in participant.producers.iter() {
                // Records can outlive a producer closed by the engine
                if self.rooms.get_producer(producer_id).is_none() {
                    continue;
                }
                self.connections.send(
                    &conn.connection_id,
                    &ServerMessage::NewProducer {
                        producer_id: producer_id.to_string(),
                        user_id: participant.user_id.clone(),
                        kind: role.kind(),
                        producer_type: role.producer_type(),
                    },
                );
            }
        }

        Ok(())
    }

    async fn leave(&self, conn: &ConnectionInfo, channel_id: Option<String>) -> SignalingResult<()> {
        let Some(channel_id) = channel_id.or_else(|| conn.channel_id.clone()) else {
            debug!("Leave from user {} outside any channel ignored", conn.user_id);
            return Ok(());
        };

        let departure = self
            .rooms
            .remove_participant_if_owned(&channel_id, &conn.user_id, &conn.connection_id)
            .await;
        if conn.channel_id.as_deref() == Some(channel_id.as_str()) {
            self.connections.clear_channel(&conn.connection_id);
        }

        self.announce_departure(&channel_id, &conn.user_id, departure?);
        Ok(())
    }

    /// Tells the remaining members which producers went away, then who left.
    ///
    /// When the record stayed with a newer connection of the same user, only
    /// the producers are announced, to that connection as well.
    fn announce_departure(&self, channel_id: &str, user_id: &str, departure: Departure) {
        let superseded = departure.record.is_none();
        for producer_id in departure.closed_producers {
            let message = ServerMessage::ProducerClosed { producer_id };
            self.connections.broadcast_to_channel(channel_id, &message, Some(user_id));
            if superseded {
                self.connections.send_to_user(user_id, &message);
            }
        }
        if superseded {
            return;
        }
        self.connections.broadcast_to_channel(
            channel_id,
            &ServerMessage::UserLeft {
                user_id: user_id.to_string(),
            },
            Some(user_id),
        );
        self.metrics.inc_leaves();
        info!("User {} left channel {}", user_id, channel_id);
    }

    async fn create_transport(&self, conn: &ConnectionInfo, direction: TransportDirection) -> SignalingResult<()> {
        let channel_id = Self::joined_channel(conn)?;
        let router = self.rooms.get_or_create_room(channel_id).await?;

        let transport = router.create_transport(direction, &self.transport_config).await?;
        let info = transport.info();
        let transport_id = info.id.clone();
        self.rooms.add_transport(TransportEntry {
            transport: transport.clone(),
            router,
            direction,
            owner: Self::owner(conn, channel_id),
        });

        let recorded = self
            .rooms
            .update_participant(channel_id, &conn.user_id, |record| {
                record.set_transport(direction, transport_id.clone())
            })
            .await;
        if let Err(e) = recorded {
            transport.close();
            return Err(e.into());
        }

        debug!("Created {} transport {} for user {}", direction, transport_id, conn.user_id);
        self.connections.send(&conn.connection_id, &ServerMessage::from(info));
        Ok(())
    }

    /// Transport created by this user, or not found
    fn owned_transport(&self, conn: &ConnectionInfo, transport_id: &str) -> SignalingResult<TransportEntry> {
        self.rooms
            .get_transport(transport_id)
            .filter(|entry| entry.owner.user_id == conn.user_id)
            .ok_or_else(|| SignalingError::TransportNotFound(transport_id.to_string()))
    }

    async fn connect_transport(
        &self,
        conn: &ConnectionInfo,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> SignalingResult<()> {
        let entry = self.owned_transport(conn, transport_id)?;
        entry.transport.connect(dtls_parameters).await?;
        debug!("Transport {} connected for user {}", transport_id, conn.user_id);
        Ok(())
    }

    async fn produce(
        &self,
        conn: &ConnectionInfo,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_type: Option<ProducerType>,
    ) -> SignalingResult<()> {
        let channel_id = Self::joined_channel(conn)?;
        let entry = self.owned_transport(conn, transport_id)?;
        if entry.owner.channel_id != channel_id {
            return Err(SignalingError::TransportNotFound(transport_id.to_string()));
        }

        let role = MediaRole::resolve(kind, producer_type);
        let meta = ProducerMeta {
            user_id: conn.user_id.clone(),
            channel_id: channel_id.to_string(),
            role,
        };
        let producer = entry.transport.produce(kind, rtp_parameters, meta).await?;
        let producer_id = producer.id();
        self.rooms.add_producer(ProducerEntry {
            producer: producer.clone(),
            role,
            owner: Self::owner(conn, channel_id),
        });

        let recorded = self
            .rooms
            .update_participant(channel_id, &conn.user_id, |record| {
                record.record_producer(role, producer_id.clone())
            })
            .await;
        if let Err(e) = recorded {
            producer.close();
            return Err(e.into());
        }
        self.metrics.inc_producers_created();
        info!("User {} producing {:?} ({})", conn.user_id, role, producer_id);

        self.connections.send(
            &conn.connection_id,
            &ServerMessage::Produced {
                producer_id: producer_id.clone(),
            },
        );
        self.connections.broadcast_to_channel(
            channel_id,
            &ServerMessage::NewProducer {
                producer_id,
                user_id: conn.user_id.clone(),
                kind,
                producer_type: role.producer_type(),
            },
            Some(&conn.user_id),
        );
        Ok(())
    }

    async fn consume(
        &self,
        conn: &ConnectionInfo,
        producer_id: &str,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> SignalingResult<()> {
        let channel_id = Self::joined_channel(conn)?;
        self.rooms
            .get_producer(producer_id)
            .filter(|entry| entry.owner.channel_id == channel_id)
            .ok_or_else(|| SignalingError::ProducerNotFound(producer_id.to_string()))?;

        let record = self
            .rooms
            .get_participant(channel_id, &conn.user_id)
            .await?
            .ok_or_else(|| SignalingError::ParticipantNotFound(conn.user_id.clone()))?;
        let recv_id = record
            .transport_id(TransportDirection::Recv)
            .ok_or(SignalingError::NoReceiveTransport)?;
        let recv = self
            .rooms
            .get_transport(recv_id)
            .ok_or_else(|| SignalingError::TransportNotFound(recv_id.to_string()))?;

        let rtp_capabilities = match rtp_capabilities.or_else(|| conn.rtp_capabilities.clone()) {
            Some(caps) => caps,
            None => router_capabilities(recv.router.as_ref())?,
        };
        if !recv.router.can_consume(producer_id, &rtp_capabilities) {
            return Err(SignalingError::CannotConsume(producer_id.to_string()));
        }

        let consumer = recv.transport.consume(producer_id, rtp_capabilities, true).await?;
        let consumer_id = consumer.id();
        self.rooms.add_consumer(ConsumerEntry {
            consumer: consumer.clone(),
            owner: Self::owner(conn, channel_id),
        });
        self.metrics.inc_consumers_created();
        debug!("User {} consuming {} via {}", conn.user_id, producer_id, consumer_id);

        self.connections.send(
            &conn.connection_id,
            &ServerMessage::Consumed {
                consumer_id,
                producer_id: consumer.producer_id(),
                kind: consumer.kind(),
                rtp_parameters: consumer.rtp_parameters(),
            },
        );
        Ok(())
    }

    async fn update_state(&self, conn: &ConnectionInfo, patch: StatePatch) -> SignalingResult<()> {
        let channel_id = Self::joined_channel(conn)?;
        let record = self.rooms.update_state(channel_id, &conn.user_id, patch).await?;

        self.connections.broadcast_to_channel(
            channel_id,
            &ServerMessage::UserStateUpdate {
                user_id: record.user_id,
                muted: record.state.muted,
                deafened: record.state.deafened,
                video_enabled: record.state.video_enabled,
            },
            None,
        );
        Ok(())
    }

    async fn resume_consumer(&self, conn: &ConnectionInfo, consumer_id: &str) -> SignalingResult<()> {
        let entry = self
            .rooms
            .get_consumer(consumer_id)
            .filter(|entry| entry.owner.user_id == conn.user_id)
            .ok_or_else(|| SignalingError::ConsumerNotFound(consumer_id.to_string()))?;
        entry.consumer.resume().await?;
        debug!("Consumer {} resumed for user {}", consumer_id, conn.user_id);
        Ok(())
    }

    /// Connection closed: unregister it and leave its channel as if `leave`
    /// had been received.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(conn) = self.connections.remove(connection_id) else {
            return;
        };
        let Some(channel_id) = conn.channel_id else {
            return;
        };

        match self
            .rooms
            .remove_participant_if_owned(&channel_id, &conn.user_id, connection_id)
            .await
        {
            Ok(departure) => self.announce_departure(&channel_id, &conn.user_id, departure),
            Err(e) => error!(
                "Failed to remove user {} from channel {} on disconnect: {}",
                conn.user_id, channel_id, e
            ),
        }
    }
}

/// The router's negotiated capabilities in client form, used when the client
/// never sent its own
fn router_capabilities(router: &dyn MediaRouter) -> SignalingResult<RtpCapabilities> {
    serde_json::to_value(router.rtp_capabilities())
        .and_then(serde_json::from_value)
        .map_err(|e| SignalingError::InvalidMessage(format!("rtpCapabilities required: {e}")))
}
