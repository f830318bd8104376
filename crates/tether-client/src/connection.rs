//! Session lifecycle: connect, background event loop, reconnect, disconnect.
//!
//! `ConnectionManager` owns at most one session at a time. `connect`
//! drives the rumqttc event loop until CONNACK under a deadline, then
//! hands the loop to a background task that dispatches inbound publishes
//! through the router and reconnects with jittered exponential backoff
//! after transport drops.

use std::sync::{Arc, Mutex};

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{Channel, MqttChannel};
use crate::config::{BrokerEndpoint, ReconnectConfig};
use crate::credentials::CredentialHandles;
use crate::error::{ClientError, ClientResult};
use crate::router::TopicRouter;
use crate::tls;

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Handshake failed or the retry limit was exhausted. Terminal for
    /// this session instance.
    Failed,
}

/// Lifecycle notifications surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Initial connect or successful reconnect.
    Connected,
    /// Transport dropped; a reconnect attempt is scheduled.
    Reconnecting { attempt: u32 },
    /// Reconnection gave up (retry limit or fatal error).
    ConnectionLost { reason: String },
}

/// One logical connection: the live channel plus the background task
/// driving its event loop.
struct Session {
    channel: MqttChannel,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the MQTT session lifecycle against one broker endpoint.
///
/// At most one session is Connecting or Connected per manager instance;
/// a second `connect` while one is live is rejected.
pub struct ConnectionManager {
    reconnect: ReconnectConfig,
    router: Arc<TopicRouter>,
    state: Arc<Mutex<SessionState>>,
    events_tx: broadcast::Sender<ClientEvent>,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(reconnect: ReconnectConfig, router: Arc<TopicRouter>) -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            reconnect,
            router,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            events_tx,
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Subscribe to lifecycle events. Each receiver sees events sent
    /// after it subscribed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// The live channel, if a session exists.
    pub fn channel(&self) -> Option<MqttChannel> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.channel.clone())
    }

    /// Establish a TLS-secured session authenticated with the
    /// materialized credentials.
    ///
    /// Blocks until CONNACK or the endpoint's connect deadline. A
    /// timed-out or failed handshake leaves the state `Failed` — never
    /// partially connected.
    pub async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &CredentialHandles,
    ) -> ClientResult<MqttChannel> {
        if self.session.lock().unwrap().is_some() {
            return Err(ClientError::Network(
                "a session is already active; disconnect it first".into(),
            ));
        }
        // Check and claim Connecting under one lock so two concurrent
        // connect calls cannot both pass the gate.
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, SessionState::Connecting | SessionState::Connected) {
                return Err(ClientError::Network(format!(
                    "a session is already {:?}; disconnect it first",
                    *state
                )));
            }
            *state = SessionState::Connecting;
        }

        let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(std::time::Duration::from_secs(endpoint.keepalive_secs.into()));
        if endpoint.use_tls {
            match tls::transport(credentials) {
                Ok(transport) => {
                    options.set_transport(transport);
                }
                Err(e) => {
                    set_state(&self.state, SessionState::Failed);
                    return Err(e);
                }
            }
        } else {
            options.set_transport(tls::plaintext_transport());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        if let Err(e) = await_connack(&mut eventloop, endpoint.connect_timeout()).await {
            set_state(&self.state, SessionState::Failed);
            return Err(e);
        }

        let channel = MqttChannel::new(client);
        set_state(&self.state, SessionState::Connected);
        let _ = self.events_tx.send(ClientEvent::Connected);
        tracing::info!(host = %endpoint.host, port = endpoint.port, client_id = %endpoint.client_id, "connected");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            eventloop,
            channel.clone(),
            self.router.clone(),
            self.state.clone(),
            self.reconnect.clone(),
            self.events_tx.clone(),
            shutdown_rx,
        ));

        *self.session.lock().unwrap() = Some(Session {
            channel: channel.clone(),
            shutdown: shutdown_tx,
            task,
        });

        Ok(channel)
    }

    /// Terminate the session gracefully. Idempotent — calling with no
    /// live session is a no-op.
    ///
    /// Pending reconnect attempts are stopped before the transport is
    /// torn down, so no reconnect can race past a disconnect.
    pub async fn disconnect(&self) -> ClientResult<()> {
        let session = self.session.lock().unwrap().take();
        let Some(session) = session else {
            return Ok(());
        };

        // Stop the supervise task first: the shutdown signal wins any
        // pending reconnect sleep, and abort is the backstop for a poll
        // already in flight.
        let _ = session.shutdown.send(true);
        let _ = session.channel.disconnect().await;
        session.task.abort();

        set_state(&self.state, SessionState::Disconnected);
        tracing::info!("disconnected");
        Ok(())
    }
}

fn set_state(state: &Mutex<SessionState>, next: SessionState) {
    *state.lock().unwrap() = next;
}

/// Poll the event loop until CONNACK or the deadline.
async fn await_connack(
    eventloop: &mut EventLoop,
    timeout: std::time::Duration,
) -> ClientResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let polled = match tokio::time::timeout_at(deadline, eventloop.poll()).await {
            Err(_) => {
                return Err(ClientError::Timeout(format!(
                    "no CONNACK within {}ms",
                    timeout.as_millis()
                )));
            }
            Ok(polled) => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(classify_refusal(code)),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(classify(&e)),
        }
    }
}

/// Map a transport error onto the client error taxonomy.
///
/// TLS failures are authentication problems (bad CA, rejected
/// certificate, corrupted key) and are fatal; I/O problems are
/// transient network errors.
fn classify(e: &ConnectionError) -> ClientError {
    match e {
        ConnectionError::Tls(tls_err) => ClientError::Authentication(tls_err.to_string()),
        ConnectionError::ConnectionRefused(code) => classify_refusal(*code),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            ClientError::Timeout(e.to_string())
        }
        other => ClientError::Network(other.to_string()),
    }
}

fn classify_refusal(code: ConnectReturnCode) -> ClientError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ClientError::Authentication(format!("broker refused credentials: {code:?}"))
        }
        other => ClientError::Network(format!("broker refused connection: {other:?}")),
    }
}

/// Drive the event loop after the initial CONNACK.
///
/// Inbound publishes are dispatched through the router on this task —
/// the dedicated dispatch context, independent of caller threads. Poll
/// errors trigger the reconnect policy; rumqttc re-establishes the
/// transport on the next poll, so reconnecting is sleeping with backoff
/// and polling again until a fresh CONNACK arrives.
async fn supervise(
    mut eventloop: EventLoop,
    channel: MqttChannel,
    router: Arc<TopicRouter>,
    state: Arc<Mutex<SessionState>>,
    reconnect: ReconnectConfig,
    events_tx: broadcast::Sender<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => return,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                router.dispatch(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                ConnectReturnCode::Success => {
                    // Reconnected. Clean-session brokers dropped our
                    // subscriptions, so replay the table.
                    tracing::info!(attempts = attempt, "transport restored");
                    attempt = 0;
                    set_state(&state, SessionState::Connected);
                    for (filter, qos) in router.snapshot() {
                        if let Err(e) = channel.subscribe(&filter, qos).await {
                            tracing::warn!(filter = %filter, error = %e, "failed to replay subscription");
                        }
                    }
                    let _ = events_tx.send(ClientEvent::Connected);
                }
                code => {
                    let err = classify_refusal(code);
                    set_state(&state, SessionState::Failed);
                    let _ = events_tx.send(ClientEvent::ConnectionLost {
                        reason: err.to_string(),
                    });
                    tracing::error!(error = %err, "broker refused reconnect");
                    return;
                }
            },
            Ok(_) => {}
            Err(e) => {
                let err = classify(&e);
                if matches!(err, ClientError::Authentication(_)) {
                    // Certificate rejection won't resolve by retrying.
                    set_state(&state, SessionState::Failed);
                    let _ = events_tx.send(ClientEvent::ConnectionLost {
                        reason: err.to_string(),
                    });
                    tracing::error!(error = %err, "fatal transport error");
                    return;
                }

                set_state(&state, SessionState::Disconnected);
                attempt += 1;
                if attempt > reconnect.max_attempts {
                    set_state(&state, SessionState::Failed);
                    let _ = events_tx.send(ClientEvent::ConnectionLost {
                        reason: err.to_string(),
                    });
                    tracing::error!(
                        error = %err,
                        attempts = attempt - 1,
                        "reconnect retry limit exhausted"
                    );
                    return;
                }

                let delay = reconnect.backoff_delay(attempt);
                tracing::warn!(
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transport dropped, reconnecting"
                );
                let _ = events_tx.send(ClientEvent::Reconnecting { attempt });

                tokio::select! {
                    _ = shutdown.changed() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStore;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ReconnectConfig::default(), Arc::new(TopicRouter::new()))
    }

    #[test]
    fn starts_disconnected() {
        let mgr = manager();
        assert_eq!(mgr.state(), SessionState::Disconnected);
        assert!(mgr.channel().is_none());
    }

    #[tokio::test]
    async fn disconnect_without_session_is_noop() {
        let mgr = manager();
        mgr.disconnect().await.unwrap();
        mgr.disconnect().await.unwrap();
        assert_eq!(mgr.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_deadline_leaves_failed_state() {
        // A listener that accepts and then stays silent: CONNECT gets no
        // CONNACK, so the deadline must fire.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _conn = listener.accept().await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let mut endpoint = BrokerEndpoint::new(addr.ip().to_string(), "test-timeout");
        endpoint.port = addr.port();
        endpoint.use_tls = false;
        endpoint.connect_timeout_ms = 100;

        let handles = CredentialStore::materialize(b"ca", b"cert", b"key").unwrap();
        let mgr = manager();

        let start = std::time::Instant::now();
        let err = mgr.connect(&endpoint, &handles).await.expect_err("must time out");
        assert!(matches!(err, ClientError::Timeout(_)), "got {err:?}");
        assert!(
            start.elapsed() < std::time::Duration::from_millis(500),
            "deadline should fire promptly"
        );
        assert_eq!(mgr.state(), SessionState::Failed);

        CredentialStore::release(handles).unwrap();
    }

    #[tokio::test]
    async fn concurrent_connect_is_rejected_while_connecting() {
        // A silent listener keeps the first connect parked in Connecting
        // long enough for a second connect to hit the gate.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _conn = listener.accept().await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let mut endpoint = BrokerEndpoint::new(addr.ip().to_string(), "test-gate");
        endpoint.port = addr.port();
        endpoint.use_tls = false;
        endpoint.connect_timeout_ms = 1_000;

        let mgr = Arc::new(manager());

        let first = {
            let mgr = mgr.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let handles = CredentialStore::materialize(b"ca", b"cert", b"key").unwrap();
                let _ = mgr.connect(&endpoint, &handles).await;
                CredentialStore::release(handles).unwrap();
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(mgr.state(), SessionState::Connecting);

        let handles = CredentialStore::materialize(b"ca", b"cert", b"key").unwrap();
        let err = mgr
            .connect(&endpoint, &handles)
            .await
            .expect_err("second connect must be rejected while one is in flight");
        assert!(matches!(err, ClientError::Network(_)), "got {err:?}");
        // The rejection must not disturb the in-flight attempt's state.
        assert_eq!(mgr.state(), SessionState::Connecting);

        first.await.unwrap();
        CredentialStore::release(handles).unwrap();
    }

    #[tokio::test]
    async fn corrupt_credentials_fail_authentication() {
        // Garbage PEM makes rustls reject the root store before any
        // network round trip completes.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _conn = listener.accept().await;
        });

        let mut endpoint = BrokerEndpoint::new(addr.ip().to_string(), "test-badcert");
        endpoint.port = addr.port();
        endpoint.connect_timeout_ms = 2_000;

        let handles =
            CredentialStore::materialize(b"not a cert", b"not a cert", b"not a key").unwrap();
        let mgr = manager();

        let err = mgr
            .connect(&endpoint, &handles)
            .await
            .expect_err("must reject credentials");
        assert!(matches!(err, ClientError::Authentication(_)), "got {err:?}");
        assert_eq!(mgr.state(), SessionState::Failed);

        CredentialStore::release(handles).unwrap();
    }

    #[test]
    fn refusal_codes_map_to_taxonomy() {
        assert!(matches!(
            classify_refusal(ConnectReturnCode::NotAuthorized),
            ClientError::Authentication(_)
        ));
        assert!(matches!(
            classify_refusal(ConnectReturnCode::ServiceUnavailable),
            ClientError::Network(_)
        ));
    }
}
