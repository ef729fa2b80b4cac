//! The reactor. One [`Server::pass`] runs every phase once, in a fixed order:
//! reap helpers, stream helper output, poll, accept, read, one command per
//! connection, world update, write, clean up, status page.

use crate::children::{ChildKind, ChildRecord, Children, Finished};
use crate::commands::{Context, Interpreter, Request};
use crate::config::Config;
use crate::dns::{DnsCache, Resolver, SystemResolver};
use crate::error::{Error, Result};
use crate::network::{Connection, Network};
use crate::prelude::*;
use crate::reboot::{self, ConnectionEntry, ListenerEntry, Manifest};
use crate::status::{Status, StatusEndpoint};
use crate::world::{Creature, Throttle, World};
use std::collections::HashSet;
use std::ffi::OsString;
use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const REBOOT_NOTICE: &str = "Sorry, we are rebooting. You may reconnect in a few seconds.\n";
const RESTORED: &str = "The world comes back into focus!\n";
const LOCKED_OUT: &str = "\nYou are not wanted here. Begone.\n";

pub fn unix_now() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub struct Server {
    config: Config,
    network: Network,
    world: World,
    children: Children,
    resolver: Arc<dyn Resolver>,
    dns: DnsCache,
    lookups: HashSet<IpAddr>,
    interpreter: Box<dyn Interpreter>,
    status: Option<StatusEndpoint>,

    shutdown_requested: Arc<AtomicBool>,
    reboot_requested: Arc<AtomicBool>,
    requests: Vec<Request>,
    exec_args: Vec<OsString>,

    pulse: u64,
    start_time: u64,
    users_update: Throttle,
    dns_prune: Throttle,
}

impl Server {
    /// Builds a server with nothing bound yet; see [`Server::bind`].
    pub fn new(config: Config, interpreter: Box<dyn Interpreter>) -> Result<Self> {
        let network = Network::new(config.max_connections)?;
        let world = World::new(&config.world, &config.intervals);
        let children = Children::new(config.worker_threads)?;
        let dns = DnsCache::load(&config.dns.cache_path);
        let status = config.admin_port.and_then(|port| match StatusEndpoint::bind(port) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                log::error!("unable to bind status port {port}: {e}");
                None
            }
        });
        Ok(Self {
            users_update: Throttle::new(config.intervals.users),
            dns_prune: Throttle::new(config.dns.prune_interval_secs),
            network,
            world,
            children,
            resolver: Arc::new(SystemResolver),
            dns,
            lookups: HashSet::new(),
            interpreter,
            status,

            shutdown_requested: Arc::new(AtomicBool::new(false)),
            reboot_requested: Arc::new(AtomicBool::new(false)),
            requests: vec![],
            exec_args: vec![],

            pulse: 0,
            start_time: unix_now(),
            config,
        })
    }
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }
    /// Arguments the next image gets on reboot, besides `--reboot`.
    pub fn set_exec_args(&mut self, args: Vec<OsString>) {
        self.exec_args = args;
    }

    /// Binds every configured port. Fails only if none of them bound.
    pub fn bind(&mut self) -> Result<()> {
        for port in self.config.ports.clone() {
            // already logged
            let _ = self.add_listen_port(port);
        }
        if self.network.listener_count() == 0 {
            return Err(Error::NoListeners);
        }
        Ok(())
    }
    pub fn add_listen_port(&mut self, port: u16) -> Result<SocketAddr> {
        self.network.add_listen_port(port).map_err(|source| {
            log::error!("unable to bind to port {port}: {source}");
            Error::Bind { port, source }
        })
    }
    /// SIGINT and SIGTERM shut down cleanly; SIGHUP reboots.
    pub fn install_signal_handlers(&self) -> Result<()> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.shutdown_requested)).map_err(Error::Signal)?;
        }
        signal_hook::flag::register(SIGHUP, Arc::clone(&self.reboot_requested)).map_err(Error::Signal)?;
        Ok(())
    }

    pub fn pulse(&self) -> u64 {
        self.pulse
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn network(&self) -> &Network {
        &self.network
    }
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }
    pub fn world(&self) -> &World {
        &self.world
    }
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
    pub fn children(&self) -> &Children {
        &self.children
    }
    pub fn dns_cache(&self) -> &DnsCache {
        &self.dns
    }
    pub fn dns_cache_mut(&mut self) -> &mut DnsCache {
        &mut self.dns
    }
    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status.as_ref().and_then(|s| s.local_addr().ok())
    }
    pub fn is_running(&self) -> bool {
        !self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Runs passes until asked to stop, then shuts down.
    pub fn run(&mut self) -> Result<()> {
        let period = self.config.pulse();
        while self.is_running() {
            if self.reboot_requested.swap(false, Ordering::Relaxed) {
                self.requests.push(Request::Reboot);
            }
            let started = time::Instant::now();
            self.pass()?;
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        self.shutdown("The server is shutting down. Goodbye!\n");
        Ok(())
    }
    pub fn pass(&mut self) -> Result<()> {
        self.pass_at(unix_now())
    }
    pub fn pass_at(&mut self, now: u64) -> Result<()> {
        if self.children.dead_children() > 0 {
            self.reap_children(now);
        }
        self.stream_children();

        self.network.poll()?;
        for key in self.network.accept(now) {
            self.admit(key, now);
        }
        self.network.process_input(now);
        self.process_commands();
        self.handle_requests();

        self.world.update_game(now, self.network.inboxes());
        self.update_users(now);

        self.network.process_output();
        self.clean_up();
        self.pulse += 1;
        self.service_status(now);
        Ok(())
    }

    /// Starts a new connection: greet it if its name is known, otherwise look it up first.
    pub fn admit(&mut self, key: ConnKey, now: u64) {
        let Some(conn) = self.network.connection_mut(key) else { return };
        let ip = conn.ip();
        if let Some(hostname) = self.dns.get(ip).map(str::to_owned) {
            self.resolved(key, &hostname);
            return;
        }
        conn.set_state(ConnState::DnsLookup);
        if !self.lookups.insert(ip) {
            return;
        }
        let resolver = Arc::clone(&self.resolver);
        self.children.spawn(
            ChildKind::DnsResolver,
            ip.to_string(),
            Box::new(move |out| {
                let hostname = resolver.reverse(ip)?;
                out.write_all(hostname.as_bytes())
            }),
        );
        log::debug!("looking up {ip} at {now}");
    }

    fn process_commands(&mut self) {
        for key in self.network.keys() {
            let Some((state, line)) = self.network.take_command(key) else { continue };
            log::trace!("{key} ({state:?}): {line}");
            let cx = Context {
                world: &mut self.world,
                inboxes: self.network.inboxes(),
                children: &mut self.children,
                config: &self.config,
                requests: &mut self.requests,
            };
            match self.interpreter.handle(cx, key, state, &line) {
                Ok(next) => {
                    // a connection dropped while the command ran stays dropped
                    if let Some(conn) = self.network.connection_mut(key).filter(|c| !c.is_disconnecting()) {
                        conn.set_state(next);
                    }
                }
                Err(Disconnection(..)) => self.network.mark_disconnecting(key),
            }
        }
    }
    fn handle_requests(&mut self) {
        for request in core::mem::take(&mut self.requests) {
            match request {
                Request::Kick(key) => self.delete_socket(key),
                Request::Shutdown => self.shutdown_requested.store(true, Ordering::Relaxed),
                Request::Reboot => {
                    if let Err(e) = self.start_reboot() {
                        log::error!("reboot failed: {e}");
                    }
                }
            }
        }
    }

    /// Drops connections that have been quiet too long, and old hostnames.
    fn update_users(&mut self, now: u64) {
        if self.dns_prune.ready(now) && self.dns.prune(now, self.config.dns.prune_after_secs) > 0 {
            self.save_dns();
        }
        if !self.users_update.ready(now) {
            return;
        }
        for key in self.network.keys() {
            let Some(conn) = self.network.connection_mut(key) else { continue };
            let role = match conn.state() {
                ConnState::Disconnecting => continue,
                ConnState::Playing => conn.player().and_then(|p| self.world.role_of(p)),
                ConnState::DnsLookup | ConnState::Login => None,
            };
            let Some(limit) = self.config.idle_timeout(role) else { continue };
            if now.saturating_sub(conn.idle_since()) >= limit {
                log::info!("connection {key} from {} timed out", conn.hostname());
                conn.inbox().print("Timed out.\n");
                conn.set_state(ConnState::Disconnecting);
            }
        }
    }

    fn clean_up(&mut self) {
        for (key, player) in self.network.clean_up() {
            if let Some(player) = player {
                log::debug!("logging out the player on {key}");
                self.world.logout(player, self.network.inboxes());
            }
        }
    }
    /// Tears a connection down now, outside the normal clean-up phase.
    pub fn delete_socket(&mut self, key: ConnKey) {
        self.network.mark_disconnecting(key);
        self.clean_up();
    }
    pub fn disconnect_all(&mut self) {
        self.network.disconnect_all();
        self.clean_up();
    }
    pub fn shutdown(&mut self, message: &str) {
        log::info!("shutting down at pulse {}", self.pulse);
        let keys = self.network.keys();
        let mut inboxes = self.network.inboxes();
        for key in keys {
            if let Some(mut inbox) = inboxes.get(key) {
                inbox.print(message);
            }
        }
        self.network.process_output();
        self.disconnect_all();
        self.save_dns();
    }
    fn save_dns(&self) {
        if let Err(e) = self.dns.save(&self.config.dns.cache_path) {
            log::warn!("unable to save dns cache: {e}");
        }
    }

    fn reap_children(&mut self, now: u64) {
        let mut dns_changed = false;
        for Finished { record, result } in self.children.reap() {
            match record.kind {
                ChildKind::DnsResolver => {
                    self.finish_lookup(&record, result, now);
                    dns_changed = true;
                }
                ChildKind::Lister => {
                    let mut lines: Vec<String> = String::from_utf8_lossy(&record.output).lines().map(str::to_owned).collect();
                    if record.truncated {
                        lines.push("(some of the listing was lost)".to_owned());
                    }
                    match result {
                        Ok(()) => lines.push("Listing complete.".to_owned()),
                        Err(e) => lines.push(format!("Listing failed: {e}")),
                    }
                    self.tell_player(&record.context, &list_lines(&lines));
                }
                ChildKind::Print => {
                    let mut text = match result {
                        Ok(()) => String::from_utf8_lossy(&record.output).into_owned(),
                        Err(e) => format!("The report failed: {e}\n"),
                    };
                    if record.truncated {
                        text.push_str("\n(the report was cut short)\n");
                    }
                    self.tell_player(&record.context, &text);
                }
                ChildKind::SwapFinish => {
                    log::info!("on_swap_finished for {}: {result:?}", record.context);
                    self.tell_player(&record.context, "The swap has finished.\n");
                }
            }
        }
        if dns_changed {
            self.save_dns();
        }
    }
    fn finish_lookup(&mut self, record: &ChildRecord, result: std::result::Result<(), String>, now: u64) {
        let Ok(ip) = record.context.parse::<IpAddr>() else {
            log::warn!("lookup finished for unparseable address {}", record.context);
            return;
        };
        self.lookups.remove(&ip);
        let resolved = match result {
            Ok(()) => String::from_utf8_lossy(&record.output).trim().to_owned(),
            Err(e) => {
                log::debug!("lookup of {ip} failed: {e}");
                String::new()
            }
        };
        let hostname = if resolved.is_empty() { ip.to_string() } else { resolved };
        self.dns.insert(ip, hostname.as_str(), now);
        let waiting: Vec<ConnKey> = self
            .network
            .iter()
            .filter(|(_, c)| c.state() == ConnState::DnsLookup && c.ip() == ip)
            .map(|(key, _)| key)
            .collect();
        for key in waiting {
            self.resolved(key, &hostname);
        }
    }
    /// The hostname of `key` is known: turn away locked-out sites and greet everyone else.
    fn resolved(&mut self, key: ConnKey, hostname: &str) {
        let Some(conn) = self.network.connection_mut(key) else { return };
        conn.set_hostname(hostname);
        if self.config.is_locked_out(hostname, conn.ip()) {
            log::info!("turning away connection {key} from locked out site {hostname}");
            conn.inbox().print(LOCKED_OUT);
            conn.set_state(ConnState::Disconnecting);
            return;
        }
        conn.set_state(ConnState::Login);
        log::info!("connection {key} from {hostname}");
        self.interpreter.greet(conn.inbox());
    }
    fn stream_children(&mut self) {
        for progress in self.children.process_children() {
            self.tell_player(&progress.context, &list_lines(&progress.lines));
        }
    }
    fn tell_player(&mut self, name: &str, text: &str) {
        let conn = self.world.player_named(name).and_then(|id| self.world.creature(id)).and_then(Creature::conn);
        let Some(conn) = conn else {
            log::debug!("{name} left before their report finished");
            return;
        };
        if let Some(mut inbox) = self.network.inboxes().get(conn) {
            inbox.print(text);
        }
    }

    fn service_status(&mut self, now: u64) {
        let Some(endpoint) = &mut self.status else { return };
        endpoint.service(|| Status {
            pulse: self.pulse,
            uptime: now.saturating_sub(self.start_time),
            connections: self.network.len(),
            players: self.world.player_count(),
            active: self.world.active().len(),
            pending_children: self.children.pending(),
            in_bytes: self.network.in_bytes(),
            out_bytes: self.network.out_bytes(),
            hour: self.world.calendar().hour,
            weather: self.world.weather(),
        });
    }

    /// Prepares every socket for handover and describes what the next image needs.
    /// Connections without a player in the world are told to come back and closed.
    pub fn capture_reboot(&mut self) -> Manifest {
        let mut connections = vec![];
        for key in self.network.keys() {
            let Some(conn) = self.network.connection_mut(key) else { continue };
            let creature = conn.player().and_then(|id| self.world.creature(id));
            match (conn.state(), creature) {
                (ConnState::Playing, Some(creature)) => {
                    connections.push(ConnectionEntry {
                        fd: conn.fd(),
                        ip: conn.ip(),
                        hostname: conn.hostname().to_owned(),
                        player: creature.name.clone(),
                        role: creature.role().unwrap_or_default(),
                        room: creature.room.and_then(|r| self.world.room(r)).map(|r| r.name.clone()),
                        telopts: conn.telopts().clone(),
                    });
                    conn.end_compress();
                }
                _ => {
                    conn.inbox().print(REBOOT_NOTICE);
                    conn.set_state(ConnState::Disconnecting);
                }
            }
        }
        self.network.process_output();
        self.clean_up();
        Manifest {
            pulse: self.pulse,
            start_time: self.start_time,
            in_bytes: self.network.in_bytes(),
            out_bytes: self.network.out_bytes(),
            timers: self.world.timers(),
            listeners: self
                .network
                .listener_fds()
                .into_iter()
                .map(|(port, fd)| ListenerEntry { port, fd })
                .collect(),
            connections,
        }
    }
    /// Hands everything to a fresh image of this executable. Only returns if that failed.
    pub fn start_reboot(&mut self) -> Result<()> {
        log::info!("rebooting at pulse {}", self.pulse);
        self.save_dns();
        let manifest = self.capture_reboot();
        for fd in manifest.descriptors() {
            reboot::inherit(fd)?;
        }
        manifest.save(&self.config.reboot_manifest)?;
        Err(reboot::exec(&self.config.reboot_manifest, &self.exec_args))
    }
    /// Captures a manifest and lets go of the sockets without closing them.
    pub fn into_manifest(mut self) -> Manifest {
        let manifest = self.capture_reboot();
        let Server { network, .. } = self;
        network.into_raw_fds();
        manifest
    }

    /// Picks up after [`Server::start_reboot`]: reads and removes the manifest, then restores from it.
    pub fn finish_reboot(config: Config, interpreter: Box<dyn Interpreter>, manifest: &std::path::Path) -> Result<Self> {
        let manifest = Manifest::load(manifest)?;
        Self::restore(config, interpreter, manifest)
    }
    /// Builds a server from what the previous image left behind.
    pub fn restore(config: Config, interpreter: Box<dyn Interpreter>, manifest: Manifest) -> Result<Self> {
        let mut server = Self::new(config, interpreter)?;
        server.pulse = manifest.pulse;
        server.start_time = manifest.start_time;
        server.network.set_counters(manifest.in_bytes, manifest.out_bytes);
        server.world.restore_timers(manifest.timers);

        for ListenerEntry { port, fd } in manifest.listeners {
            // SAFETY: the previous image handed this listening socket over and nothing here owns it yet.
            let socket = unsafe { TcpListener::from_raw_fd(fd) };
            if let Err(e) = server.network.add_listener(socket) {
                log::error!("unable to resume listening on port {port}: {e}");
            }
        }
        if server.network.listener_count() == 0 {
            return Err(Error::NoListeners);
        }

        let now = unix_now();
        for entry in manifest.connections {
            // SAFETY: as for listeners, the descriptor is an inherited connected socket with no other owner.
            let stream = unsafe { TcpStream::from_raw_fd(entry.fd) };
            let key = match Connection::restore(stream, entry.ip, now, entry.telopts).and_then(|c| server.network.insert(c)) {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("lost {} across the reboot: {e}", entry.player);
                    continue;
                }
            };
            if let Some(conn) = server.network.connection_mut(key) {
                conn.set_hostname(entry.hostname);
                conn.set_state(ConnState::Playing);
            }
            let room = entry.room.as_deref().and_then(|name| server.world.room_named(name));
            let player = server.world.login(key, &entry.player, entry.role, room, server.network.inboxes());
            log::debug!("{} restored as {player} on {key}", entry.player);
            if let Some(mut inbox) = server.network.inboxes().get(key) {
                inbox.print(RESTORED);
                inbox.prompt("> ");
            }
        }
        log::info!(
            "resumed at pulse {} with {} connections",
            server.pulse,
            server.network.len()
        );
        Ok(server)
    }
}

fn list_lines(lines: &[String]) -> String {
    lines.iter().map(|line| format!("List> {line}\n")).collect()
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("pulse", &self.pulse)
            .field("network", &self.network)
            .field("children", &self.children)
            .finish()
    }
}
