//! The connected session: transport, registration, and the dispatch loop.
//!
//! One session = one connection. Inbound lines are dispatched to completion
//! (including any nested collector exchange) before the next line is read,
//! and the probe tick runs on the same loop, so the tree never sees two
//! writers. The tick fires every ten seconds on the ten seconds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::Utc;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::{Config, Endpoint};
use crate::irc::codec::{CodecError, LineCodec};
use crate::irc::message::{self, Message};

use super::collector::{ExchangeError, ReplyCollector};
use super::dispatcher::{translate, Action, Dispatcher, Elevation, Refresh};
use super::prober::Prober;

/// Probe interval; ticks align to multiples of this on the wall clock.
const TICK_SECS: i64 = 10;

/// Type-erased connection — plain TCP or TLS, same framing either way.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Wire = Framed<Box<dyn Transport>, LineCodec>;

/// Computes the response to an oper challenge blob. Key handling (and the
/// choice of mechanism) lives entirely behind this seam.
pub trait ChallengeResponder: Send + Sync {
    fn respond(
        &self,
        challenge: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("host {0:?} is not a valid TLS server name")]
    BadServerName(String),
    #[error("SASL authentication rejected")]
    SaslRejected,
    #[error("server closed the connection")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaslState {
    Inactive,
    Requested,
    Offered,
    Done,
}

/// Work queue items: inbound lines and dispatcher actions share one queue so
/// lines deferred by a collector exchange replay in arrival order.
enum Item {
    Line(Message),
    Act(Action),
}

/// Connect and run until the server hangs up.
pub async fn run(
    config: Config,
    responder: Option<Box<dyn ChallengeResponder>>,
) -> Result<(), SessionError> {
    let endpoint = config.endpoint()?;
    info!(server = %config.server, "connecting");
    let transport = connect(&endpoint).await?;
    let wire = Framed::new(transport, LineCodec);
    Session::new(config, responder).drive(wire).await
}

struct Session {
    config: Config,
    dispatcher: Dispatcher,
    collector: ReplyCollector,
    responder: Option<Box<dyn ChallengeResponder>>,
    sasl: SaslState,
    tick_period_ms: i64,
}

impl Session {
    fn new(config: Config, responder: Option<Box<dyn ChallengeResponder>>) -> Self {
        let elevation = match &config.oper.password {
            Some(password) => Elevation::Oper {
                name: config.oper.name.clone(),
                password: password.clone(),
            },
            None => Elevation::Challenge {
                name: config.oper.name.clone(),
            },
        };
        let prober = Prober::new(config.warn_threshold, config.ignore.iter().cloned());
        let dispatcher = Dispatcher::new(&config.nickname, elevation, prober);
        Session {
            config,
            dispatcher,
            collector: ReplyCollector::new(),
            responder,
            sasl: SaslState::Inactive,
            tick_period_ms: TICK_SECS * 1000,
        }
    }

    async fn drive(mut self, mut wire: Wire) -> Result<(), SessionError> {
        self.register(&mut wire).await?;

        let mut tick_at = next_tick(self.tick_period_ms);
        loop {
            tokio::select! {
                frame = wire.next() => match frame {
                    Some(Ok(msg)) => {
                        let mut work = VecDeque::from([Item::Line(msg)]);
                        self.drain(&mut wire, &mut work).await?;
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(SessionError::Closed),
                },
                _ = tokio::time::sleep_until(tick_at) => {
                    tick_at = next_tick(self.tick_period_ms);
                    let mut work: VecDeque<Item> =
                        self.dispatcher.tick(Utc::now()).into_iter().map(Item::Act).collect();
                    self.drain(&mut wire, &mut work).await?;
                }
            }
        }
    }

    async fn register(&mut self, wire: &mut Wire) -> Result<(), SessionError> {
        if let Some(password) = &self.config.password {
            let pass = Message::cmd("PASS", [password.clone()]);
            send(wire, pass).await?;
        }
        if self.config.sasl.is_some() {
            send(wire, Message::cmd("CAP", ["REQ", "sasl"])).await?;
            self.sasl = SaslState::Requested;
        }
        send(wire, Message::cmd("NICK", [self.config.nickname.clone()])).await?;
        send(
            wire,
            Message::cmd(
                "USER",
                [
                    self.config.username().to_owned(),
                    "0".to_owned(),
                    "*".to_owned(),
                    self.config.realname().to_owned(),
                ],
            ),
        )
        .await?;
        Ok(())
    }

    /// Process the work queue to exhaustion. Collector exchanges push their
    /// follow-up actions and their deferred lines back onto the queue.
    async fn drain(
        &mut self,
        wire: &mut Wire,
        work: &mut VecDeque<Item>,
    ) -> Result<(), SessionError> {
        while let Some(item) = work.pop_front() {
            match item {
                Item::Line(msg) => {
                    debug!("< {msg}");
                    if self.session_line(wire, &msg).await? {
                        continue;
                    }
                    if let Some(event) = translate(&msg) {
                        for action in self.dispatcher.handle(event, Utc::now()) {
                            work.push_back(Item::Act(action));
                        }
                    }
                }
                Item::Act(Action::Send(msg)) => send(wire, msg).await?,
                Item::Act(Action::Alert(text)) => {
                    let msg = Message::cmd("PRIVMSG", [self.config.channel.clone(), text]);
                    send(wire, msg).await?;
                }
                Item::Act(Action::FetchLinks(refresh)) => {
                    self.fetch_links(wire, work, refresh).await?;
                }
                Item::Act(Action::FetchChallenge { oper }) => {
                    self.fetch_challenge(wire, work, &oper).await?;
                }
            }
        }
        Ok(())
    }

    /// Connection-keeping lines handled below the dispatcher. Returns true
    /// when the line is consumed here.
    async fn session_line(
        &mut self,
        wire: &mut Wire,
        msg: &Message,
    ) -> Result<bool, SessionError> {
        match msg.command.as_str() {
            "PING" => {
                send(wire, Message::cmd("PONG", msg.params.clone())).await?;
                Ok(true)
            }
            "ERROR" => {
                info!(detail = ?msg.params.first(), "server sent ERROR");
                Ok(true)
            }
            "CAP" => {
                let verb = msg.params.get(1).map(String::as_str);
                let caps = msg.params.last().map(String::as_str).unwrap_or("");
                match verb {
                    Some("ACK") if caps.contains("sasl") && self.sasl == SaslState::Requested => {
                        send(wire, Message::cmd("AUTHENTICATE", ["PLAIN"])).await?;
                        self.sasl = SaslState::Offered;
                    }
                    Some("NAK") if self.sasl == SaslState::Requested => {
                        return Err(SessionError::SaslRejected);
                    }
                    _ => {}
                }
                Ok(true)
            }
            "AUTHENTICATE" if msg.params.first().map(String::as_str) == Some("+") => {
                if self.sasl == SaslState::Offered {
                    if let Some(sasl) = &self.config.sasl {
                        let blob = sasl_blob(&sasl.username, &sasl.password);
                        send(wire, Message::cmd("AUTHENTICATE", [blob])).await?;
                    }
                }
                Ok(true)
            }
            message::RPL_SASLSUCCESS => {
                self.sasl = SaslState::Done;
                send(wire, Message::cmd("CAP", ["END"])).await?;
                Ok(true)
            }
            message::ERR_SASLFAIL => Err(SessionError::SaslRejected),
            _ => Ok(false),
        }
    }

    async fn fetch_links(
        &mut self,
        wire: &mut Wire,
        work: &mut VecDeque<Item>,
        refresh: Refresh,
    ) -> Result<(), SessionError> {
        let result = self
            .collector
            .exchange(
                wire,
                Message::bare("LINKS"),
                |m| m.command == message::RPL_LINKS,
                |m| m.command == message::RPL_ENDOFLINKS,
            )
            .await;
        match result {
            Ok(collected) => {
                let pairs = link_pairs(&collected.replies);
                for action in self.dispatcher.listing_loaded(pairs, refresh, Utc::now()) {
                    work.push_back(Item::Act(action));
                }
                for line in collected.deferred {
                    work.push_back(Item::Line(line));
                }
                Ok(())
            }
            Err(ExchangeError::Aborted) => {
                // The read loop surfaces the close; just record the miss.
                self.dispatcher.listing_failed(&refresh);
                Ok(())
            }
            Err(ExchangeError::Codec(err)) => Err(err.into()),
        }
    }

    async fn fetch_challenge(
        &mut self,
        wire: &mut Wire,
        work: &mut VecDeque<Item>,
        oper: &str,
    ) -> Result<(), SessionError> {
        if self.responder.is_none() {
            warn!("oper has no password and no challenge responder; cannot elevate");
            return Ok(());
        }
        let result = self
            .collector
            .exchange(
                wire,
                Message::cmd("CHALLENGE", [oper]),
                |m| m.command == message::RPL_RSACHALLENGE2,
                |m| m.command == message::RPL_ENDOFRSACHALLENGE2,
            )
            .await;
        match result {
            Ok(collected) => {
                let blob: String = collected
                    .replies
                    .iter()
                    .filter_map(|m| m.params.last().map(String::as_str))
                    .collect();
                if let Some(responder) = &self.responder {
                    match responder.respond(&blob) {
                        Ok(response) => work.push_back(Item::Act(Action::Send(Message::cmd(
                            "CHALLENGE",
                            [format!("+{response}")],
                        )))),
                        Err(err) => warn!(%err, "challenge response failed; not elevated"),
                    }
                }
                for line in collected.deferred {
                    work.push_back(Item::Line(line));
                }
                Ok(())
            }
            Err(ExchangeError::Aborted) => {
                warn!("challenge exchange aborted");
                Ok(())
            }
            Err(ExchangeError::Codec(err)) => Err(err.into()),
        }
    }
}

async fn send(wire: &mut Wire, msg: Message) -> Result<(), SessionError> {
    debug!("> {msg}");
    wire.send(msg).await?;
    Ok(())
}

/// Open the TCP connection, wrapped in TLS when the endpoint asks for it.
async fn connect(endpoint: &Endpoint) -> Result<Box<dyn Transport>, SessionError> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    if !endpoint.tls {
        return Ok(Box::new(tcp));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
        .map_err(|_| SessionError::BadServerName(endpoint.host.clone()))?;
    Ok(Box::new(connector.connect(name, tcp).await?))
}

/// Extract `(server, uplink)` pairs from LINKS replies, skipping anything
/// that doesn't carry both fields.
fn link_pairs(replies: &[Message]) -> Vec<(String, String)> {
    replies
        .iter()
        .filter_map(|msg| match (msg.params.get(1), msg.params.get(2)) {
            (Some(server), Some(uplink)) => Some((server.clone(), uplink.clone())),
            _ => {
                warn!(%msg, "malformed LINKS reply; skipped");
                None
            }
        })
        .collect()
}

/// SASL PLAIN initial response: `authzid NUL authcid NUL password`.
fn sasl_blob(username: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(format!("{username}\0{username}\0{password}"))
}

/// The next wall-clock multiple of the tick period.
fn next_tick(period_ms: i64) -> tokio::time::Instant {
    let rem = Utc::now().timestamp_millis().rem_euclid(period_ms);
    tokio::time::Instant::now() + Duration::from_millis((period_ms - rem) as u64)
}
