//! MQTT subscription client.
//!
//! [`SubscriptionClient::run`] drives a [`BrokerTransport`] and owns the
//! connection state machine:
//!
//! ```text
//! Disconnected --poll--> Connecting --CONNACK--> Connected --error--> Disconnected
//!                                                   |
//!                                                PUBLISH -> handler -> ack
//! ```
//!
//! The topic filter is subscribed on every entry into `Connected`; broker-side
//! subscription state is never assumed to survive a reconnect. Errors before
//! the first successful CONNACK are returned to the caller, later ones are
//! logged and the transport is polled again after `reconnect_delay`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Packet, Publish, QoS, SubscribeReasonCode,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::pipeline::MessageHandler;

/// Capacity of the request channel between `AsyncClient` and `EventLoop`.
/// Well above a broker's usual inflight window (mosquitto: 20).
const REQUEST_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("MQTT connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("MQTT broker refused connection: {0}")]
    Refused(String),
}

/// Transport-level events the client reacts to.
#[derive(Debug)]
pub enum BrokerEvent {
    /// CONNACK accepted.
    Connected,
    /// CONNACK rejected, with the broker's reason.
    Refused(String),
    Message(Publish),
    /// Pings, acks and other protocol traffic.
    Other,
}

/// Seam between the state machine and the MQTT library.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Next event. `Ok(None)` means the transport is closed for good.
    async fn poll(&mut self) -> Result<Option<BrokerEvent>, BrokerError>;
    /// Queue a SUBSCRIBE without waiting on the event loop. It must be sent
    /// even if the queue is momentarily full.
    fn subscribe(&mut self, filter: &str);
    /// Queue the acknowledgement for a handled message. Same guarantee.
    fn ack(&mut self, publish: &Publish);
}

// ------------------------------------------------------------------ //
//  rumqttc transport                                                  //
// ------------------------------------------------------------------ //

/// Request waiting for room in the `AsyncClient` channel.
#[derive(Debug)]
enum Outgoing {
    Subscribe(String),
    Ack(Publish),
}

/// [`BrokerTransport`] backed by `rumqttc`. Reconnection happens inside
/// `EventLoop::poll` on the call after an error.
///
/// Requests are queued with `try_*` because the event loop is polled by the
/// same task. A request that finds the channel full is parked in `outgoing`
/// and offered again before every poll, so no PUBACK is ever dropped.
pub struct RumqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    outgoing: VecDeque<Outgoing>,
}

impl RumqttTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        // Ack only after the handler has run so a crash mid-write means redelivery.
        options.set_manual_acks(true);
        if let Some(user) = &config.username {
            options.set_credentials(user, config.password.as_deref().unwrap_or(""));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        Self {
            client,
            eventloop,
            outgoing: VecDeque::new(),
        }
    }

    /// Move parked requests into the channel, oldest first, until it is full.
    fn flush_outgoing(&mut self) {
        while let Some(request) = self.outgoing.front() {
            let sent = match request {
                Outgoing::Subscribe(filter) => {
                    self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce)
                }
                Outgoing::Ack(publish) => self.client.try_ack(publish),
            };
            match sent {
                Ok(()) => {
                    self.outgoing.pop_front();
                }
                Err(e) => {
                    debug!(error = %e, parked = self.outgoing.len(), "request deferred; channel full");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for RumqttTransport {
    async fn poll(&mut self) -> Result<Option<BrokerEvent>, BrokerError> {
        self.flush_outgoing();
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(code = ?ack.code, session_present = ack.session_present, "CONNACK");
                // Packet ids from the previous session mean nothing to this one.
                self.outgoing.retain(|r| !matches!(r, Outgoing::Ack(_)));
                if ack.code == ConnectReturnCode::Success {
                    Ok(Some(BrokerEvent::Connected))
                } else {
                    Ok(Some(BrokerEvent::Refused(format!("{:?}", ack.code))))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(Some(BrokerEvent::Message(publish))),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|c| matches!(c, SubscribeReasonCode::Failure))
                {
                    warn!(pkid = ack.pkid, "broker rejected subscription");
                }
                Ok(Some(BrokerEvent::Other))
            }
            Ok(_) => Ok(Some(BrokerEvent::Other)),
            Err(ConnectionError::ConnectionRefused(code)) => {
                Ok(Some(BrokerEvent::Refused(format!("{code:?}"))))
            }
            Err(ConnectionError::RequestsDone) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe(&mut self, filter: &str) {
        self.outgoing.push_back(Outgoing::Subscribe(filter.to_owned()));
        self.flush_outgoing();
    }

    fn ack(&mut self, publish: &Publish) {
        self.outgoing.push_back(Outgoing::Ack(publish.clone()));
        self.flush_outgoing();
    }
}

// ------------------------------------------------------------------ //
//  State machine                                                      //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct SubscriptionClient<T> {
    transport: T,
    topic: String,
    reconnect_delay: Duration,
    state: ConnectionState,
    connects: u64,
}

impl<T: BrokerTransport> SubscriptionClient<T> {
    pub fn new(transport: T, topic: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            transport,
            topic: topic.into(),
            reconnect_delay,
            state: ConnectionState::Disconnected,
            connects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Successful connections so far, reconnects included.
    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Receive loop. Returns `Ok(())` when the transport closes and `Err` on
    /// a startup failure; otherwise runs forever.
    pub async fn run<H>(&mut self, handler: &mut H) -> Result<(), BrokerError>
    where
        H: MessageHandler + ?Sized,
    {
        loop {
            if self.state == ConnectionState::Disconnected {
                self.state = ConnectionState::Connecting;
                debug!("MQTT connecting");
            }

            let event = match self.transport.poll().await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.state = ConnectionState::Disconnected;
                    info!("MQTT transport closed");
                    return Ok(());
                }
                Err(e) => {
                    self.connection_lost(e).await?;
                    continue;
                }
            };

            match event {
                BrokerEvent::Connected => {
                    self.state = ConnectionState::Connected;
                    self.connects += 1;
                    info!(connects = self.connects, "MQTT connected");
                    self.transport.subscribe(&self.topic);
                    info!(topic = %self.topic, "MQTT subscribed");
                }
                BrokerEvent::Refused(reason) => {
                    self.connection_lost(BrokerError::Refused(reason)).await?;
                }
                BrokerEvent::Message(publish) => {
                    handler.handle(&publish.topic, &publish.payload).await;
                    self.transport.ack(&publish);
                }
                BrokerEvent::Other => {}
            }
        }
    }

    async fn connection_lost(&mut self, err: BrokerError) -> Result<(), BrokerError> {
        self.state = ConnectionState::Disconnected;
        if self.connects == 0 {
            error!(error = %err, "MQTT connection failed at startup");
            return Err(err);
        }
        warn!(
            error = %err,
            delay_secs = self.reconnect_delay.as_secs_f64(),
            "MQTT connection lost; reconnecting"
        );
        tokio::time::sleep(self.reconnect_delay).await;
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
