//! Event routing.
//!
//! The dispatcher is the single entry point for parsed protocol events. It
//! owns the tree and the prober, runs the registration phase machine, and
//! answers every event with a list of [`Action`]s for the session layer to
//! execute. It never touches the wire itself, which keeps the whole routing
//! surface synchronous and testable.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::irc::message::{self, Message};

use super::notice::{recognize, Notice};
use super::prober::Prober;
use super::topology::Topology;

/// A parsed inbound protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Registration completed; `server` is our uplink.
    Welcome { server: String },
    /// Oper privileges granted.
    Elevated,
    /// A server answered a liveness probe.
    LivenessReply { source: String },
    /// A server answered a population query.
    PopulationReply { source: String, count: u32 },
    /// A recognized server notice.
    ServerNotice { source: String, notice: Notice },
}

/// Why a listing refresh was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    /// First listing after elevation.
    Initial,
    /// Re-listing after a netjoin notice.
    Join { near: String, far: String },
}

/// One thing the session layer should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a protocol command.
    Send(Message),
    /// Emit one alert line to the ops channel.
    Alert(String),
    /// Run the LINKS listing through the reply collector, then feed the
    /// result back via [`Dispatcher::listing_loaded`] or
    /// [`Dispatcher::listing_failed`].
    FetchLinks(Refresh),
    /// Run the oper challenge exchange through the reply collector.
    FetchChallenge { oper: String },
}

/// How to obtain oper privileges after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elevation {
    /// Plain `OPER <name> <password>`.
    Oper { name: String, password: String },
    /// `CHALLENGE <name>`, answered through the reply collector.
    Challenge { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unregistered,
    AwaitingElevation,
    Ready,
}

#[derive(Debug)]
pub struct Dispatcher {
    nickname: String,
    elevation: Elevation,
    phase: Phase,
    /// Set once the initial listing has been merged; notices that need the
    /// tree and the probe tick are gated on it.
    links_ready: bool,
    topology: Topology,
    prober: Prober,
}

/// Map an inbound line to an event, if it is one this bot consumes.
pub fn translate(msg: &Message) -> Option<Event> {
    match msg.command.as_str() {
        message::RPL_WELCOME => msg.source_name().map(|server| Event::Welcome {
            server: server.to_owned(),
        }),
        message::RPL_YOUREOPER => Some(Event::Elevated),
        message::RPL_TIME if msg.from_server() => {
            msg.source_name().map(|source| Event::LivenessReply {
                source: source.to_owned(),
            })
        }
        message::RPL_LOCALUSERS if msg.from_server() => {
            let source = msg.source_name()?.to_owned();
            let count = msg.params.get(1)?.parse().ok()?;
            Some(Event::PopulationReply { source, count })
        }
        "NOTICE" if msg.from_server() && msg.params.first().map(String::as_str) == Some("*") => {
            let source = msg.source_name()?.to_owned();
            let notice = recognize(msg.params.get(1)?)?;
            Some(Event::ServerNotice { source, notice })
        }
        _ => None,
    }
}

impl Dispatcher {
    pub fn new(nickname: &str, elevation: Elevation, prober: Prober) -> Self {
        Dispatcher {
            nickname: nickname.to_owned(),
            elevation,
            phase: Phase::Unregistered,
            links_ready: false,
            topology: Topology::new(),
            prober,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// True once elevation succeeded and the initial listing is merged.
    pub fn ready(&self) -> bool {
        self.phase == Phase::Ready && self.links_ready
    }

    /// Route one inbound event.
    pub fn handle(&mut self, event: Event, now: DateTime<Utc>) -> Vec<Action> {
        match event {
            Event::Welcome { server } => self.on_welcome(&server),
            Event::Elevated => self.on_elevated(),
            Event::LivenessReply { source } => {
                if !self.links_ready {
                    debug!(source, "liveness reply before listing; dropped");
                    return Vec::new();
                }
                self.prober
                    .on_reply(&mut self.topology, &source, now)
                    .map(Action::Alert)
                    .into_iter()
                    .collect()
            }
            Event::PopulationReply { source, count } => {
                if !self.links_ready {
                    debug!(source, "population reply before listing; dropped");
                    return Vec::new();
                }
                if let Err(err) = self.topology.record_population(&source, count, now) {
                    // The reply can race a split that already removed the server.
                    warn!(%err, "population reply dropped");
                }
                Vec::new()
            }
            Event::ServerNotice { source, notice } => self.on_notice(&source, notice, now),
        }
    }

    /// Run one probe wave. A no-op until the session is ready.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        if !self.ready() {
            return Vec::new();
        }
        let wave = self.prober.tick(&mut self.topology, now);
        let mut actions: Vec<Action> = wave
            .probes
            .into_iter()
            .map(|name| Action::Send(Message::cmd("TIME", [name])))
            .collect();
        actions.extend(wave.alerts.into_iter().map(Action::Alert));
        actions
    }

    /// A listing exchange finished; merge it and finish what triggered it.
    pub fn listing_loaded(
        &mut self,
        pairs: Vec<(String, String)>,
        refresh: Refresh,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        if let Err(err) = self.topology.rebuild(&pairs) {
            warn!(%err, "discarding malformed listing");
            return Vec::new();
        }

        // Baseline population for servers the merge introduced.
        let mut actions: Vec<Action> = self
            .topology
            .unknown_population()
            .into_iter()
            .map(|name| Action::Send(Message::cmd("LUSERS", ["*".to_owned(), name])))
            .collect();

        match refresh {
            Refresh::Initial => {
                self.links_ready = true;
                info!(servers = self.topology.len(), "topology loaded");
            }
            Refresh::Join { near, far } => {
                // The join itself proves the far side is alive right now.
                if let Some(entry) = self.topology.get_mut(&far) {
                    entry.last_reply = Some(now);
                } else {
                    warn!(far, "netjoin named a server the listing does not");
                }
                let mut below = self.topology.descendants(&far);
                below.sort();
                actions.push(Action::Alert(format!("INFO: {far} joined to {near}")));
                actions.push(Action::Alert(format!("{far} downlinks: {}", below.join(", "))));
            }
        }
        actions
    }

    /// A listing exchange aborted. Keep prior state; the next elevation or
    /// join notice triggers another attempt — never a retry timer.
    pub fn listing_failed(&mut self, refresh: &Refresh) {
        warn!(?refresh, "listing exchange aborted; topology refresh skipped");
    }

    fn on_welcome(&mut self, server: &str) -> Vec<Action> {
        if self.phase != Phase::Unregistered {
            warn!(server, "duplicate welcome; dropped");
            return Vec::new();
        }
        if let Err(err) = self.topology.register(server) {
            warn!(%err, "cannot seed topology");
            return Vec::new();
        }
        self.phase = Phase::AwaitingElevation;

        let mut actions = vec![Action::Send(Message::cmd(
            "MODE",
            [self.nickname.clone(), "+g".to_owned()],
        ))];
        match &self.elevation {
            Elevation::Oper { name, password } => actions.push(Action::Send(Message::cmd(
                "OPER",
                [name.clone(), password.clone()],
            ))),
            Elevation::Challenge { name } => {
                actions.push(Action::FetchChallenge { oper: name.clone() })
            }
        }
        actions
    }

    fn on_elevated(&mut self) -> Vec<Action> {
        if self.phase == Phase::Unregistered {
            warn!("elevation granted before welcome; dropped");
            return Vec::new();
        }
        self.phase = Phase::Ready;
        vec![
            // F: remote client notices, c: local client notices, s: netsplits.
            Action::Send(Message::cmd(
                "MODE",
                [self.nickname.clone(), "-s+s".to_owned(), "+Fcs".to_owned()],
            )),
            Action::FetchLinks(Refresh::Initial),
        ]
    }

    fn on_notice(&mut self, source: &str, notice: Notice, now: DateTime<Utc>) -> Vec<Action> {
        if self.phase != Phase::Ready || !self.topology.contains(source) {
            debug!(source, ?notice, "notice from untracked server; dropped");
            return Vec::new();
        }
        match notice {
            Notice::ClientConnect { .. } => {
                self.topology.record_connect(source, now);
                Vec::new()
            }
            Notice::ClientExit { .. } => {
                self.topology.record_disconnect(source, now);
                Vec::new()
            }
            Notice::Split { near, far } => {
                if !self.links_ready {
                    debug!(near, far, "netsplit before listing; dropped");
                    return Vec::new();
                }
                match self.topology.apply_split(&near, &far) {
                    Ok(mut affected) => {
                        let mut alerts = vec![Action::Alert(format!(
                            "WARN: {far} split from {near}"
                        ))];
                        if !affected.is_empty() {
                            affected.sort();
                            alerts.push(Action::Alert(format!(
                                "{far} downlinks: {}",
                                affected.join(", ")
                            )));
                        }
                        alerts
                    }
                    Err(err) => {
                        // Splits can race our own refresh; stale ones are noise.
                        warn!(%err, near, far, "netsplit for untracked server; dropped");
                        Vec::new()
                    }
                }
            }
            Notice::Join { near, far } => {
                if !self.links_ready {
                    debug!(near, far, "netjoin before listing; dropped");
                    return Vec::new();
                }
                vec![Action::FetchLinks(Refresh::Join { near, far })]
            }
        }
    }
}
