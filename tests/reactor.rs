use mudserv::commands::{Context, Interpreter, Lobby};
use mudserv::config::DnsConfig;
use mudserv::dns::Resolver;
use mudserv::network::{ConnState, Connection, Inbox};
use mudserv::server::unix_now;
use mudserv::status::Status;
use mudserv::types::{ConnKey, Disconnection};
use mudserv::{Config, Error, Server};
use std::cell::RefCell;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(dir: &Path) -> Config {
    Config {
        ports: vec![],
        dns: DnsConfig {
            cache_path: dir.join("dns.json"),
            ..DnsConfig::default()
        },
        reboot_manifest: dir.join("reboot.json"),
        ..Config::default()
    }
}

/// A server that already knows the loopback address, so connections skip the lookup.
fn server(dir: &Path, interpreter: Box<dyn Interpreter>) -> (Server, SocketAddr) {
    let mut server = Server::new(config(dir), interpreter).unwrap();
    server.dns_cache_mut().insert(Ipv4Addr::LOCALHOST.into(), "localhost", unix_now());
    let addr = server.add_listen_port(0).unwrap();
    (server, addr)
}

fn connect(server: &mut Server, addr: SocketAddr) -> (TcpStream, ConnKey) {
    let before: HashSet<ConnKey> = server.network().keys().into_iter().collect();
    let client = TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).unwrap();
    for _ in 0..400 {
        server.pass().unwrap();
        if let Some(key) = server.network().keys().into_iter().find(|k| !before.contains(k)) {
            client.set_nonblocking(true).unwrap();
            return (client, key);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("connection was never accepted");
}

fn read_until(server: &mut Server, client: &mut TcpStream, needle: &str) -> String {
    let mut seen = vec![];
    let mut buf = [0; 4096];
    for _ in 0..400 {
        server.pass().unwrap();
        match client.read(&mut buf) {
            Ok(0) => panic!("server hung up"),
            Ok(n) => seen.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("read failed: {e}"),
        }
        let text = String::from_utf8_lossy(&seen).into_owned();
        if text.contains(needle) {
            return text;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("never saw {needle:?} in {:?}", String::from_utf8_lossy(&seen));
}

struct Recorder(Rc<RefCell<Vec<String>>>);
impl Interpreter for Recorder {
    fn greet(&mut self, _: Inbox) {}
    fn handle(&mut self, _: Context, _: ConnKey, state: ConnState, line: &str) -> Result<ConnState, Disconnection> {
        self.0.borrow_mut().push(line.to_owned());
        Ok(state)
    }
}

#[test]
fn one_command_per_connection_per_pass() {
    let dir = tempfile::tempdir().unwrap();
    let log = Rc::new(RefCell::new(vec![]));
    let (mut server, addr) = server(dir.path(), Box::new(Recorder(Rc::clone(&log))));
    let (mut a, ka) = connect(&mut server, addr);
    let (mut b, kb) = connect(&mut server, addr);
    assert_eq!(server.network().connection(ka).unwrap().state(), ConnState::Login);

    a.write_all(b"a1\r\na2\r\na3\r\n").unwrap();
    b.write_all(b"b1\r\nb2\r\nb3\r\n").unwrap();
    // collect the input without running any of it
    for _ in 0..400 {
        let network = server.network_mut();
        network.poll().unwrap();
        network.process_input(unix_now());
        network.process_output();
        let queued = |k| network.connection(k).map_or(0, |c| c.queued_commands());
        if queued(ka) == 3 && queued(kb) == 3 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(log.borrow().is_empty());

    let mut first = None;
    for pass in 1..=3 {
        server.pass().unwrap();
        let log = log.borrow();
        assert_eq!(log.len(), 2 * pass);
        let ran = &log[log.len() - 2..];
        let mut sorted: Vec<&str> = ran.iter().map(String::as_str).collect();
        sorted.sort();
        assert_eq!(sorted, vec![format!("a{pass}"), format!("b{pass}")]);
        let leader = ran[0].chars().next();
        assert_eq!(*first.get_or_insert(leader), leader);
    }
    server.pass().unwrap();
    assert_eq!(log.borrow().len(), 6);
}

struct Fixed(&'static str);
impl Resolver for Fixed {
    fn reverse(&self, _: IpAddr) -> io::Result<String> {
        Ok(self.0.to_owned())
    }
}

#[test]
fn lookup_moves_waiting_connections_to_login() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(config(dir.path()), Box::new(Lobby))
        .unwrap()
        .with_resolver(Arc::new(Fixed("host.example.com")));

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (stream, _) = listener.accept().unwrap();
    let ip: IpAddr = "203.0.113.5".parse().unwrap();
    let conn = Connection::accept(stream, ip, unix_now()).unwrap();
    let key = server.network_mut().insert(conn).unwrap();
    server.admit(key, unix_now());
    assert_eq!(server.network().connection(key).unwrap().state(), ConnState::DnsLookup);
    assert_eq!(server.children().pending(), 1);

    // typed before the lookup finished; held until it does
    client.write_all(b"Alice\r\n").unwrap();
    client.set_nonblocking(true).unwrap();
    let text = read_until(&mut server, &mut client, "Welcome, Alice.");
    assert!(text.contains("By what name are you known?"));

    let conn = server.network().connection(key).unwrap();
    assert_eq!(conn.hostname(), "host.example.com");
    assert_eq!(conn.state(), ConnState::Playing);
    assert_eq!(server.dns_cache().get(ip), Some("host.example.com"));
    assert_eq!(server.children().pending(), 0);
    assert!(dir.path().join("dns.json").exists());
}

struct Unresolvable;
impl Resolver for Unresolvable {
    fn reverse(&self, _: IpAddr) -> io::Result<String> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no PTR record"))
    }
}

/// Hands the server a loopback stream that claims to come from `ip`.
fn fake_peer(server: &mut Server, ip: &str) -> (TcpStream, ConnKey) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (stream, _) = listener.accept().unwrap();
    let conn = Connection::accept(stream, ip.parse().unwrap(), unix_now()).unwrap();
    let key = server.network_mut().insert(conn).unwrap();
    server.admit(key, unix_now());
    client.set_nonblocking(true).unwrap();
    (client, key)
}

fn settle_lookups(server: &mut Server) {
    for _ in 0..400 {
        server.pass().unwrap();
        if server.children().pending() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("lookups never finished");
}

#[test]
fn failed_or_empty_lookups_fall_back_to_the_address() {
    let resolvers: [Arc<dyn Resolver>; 2] = [Arc::new(Unresolvable), Arc::new(Fixed(""))];
    for resolver in resolvers {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(config(dir.path()), Box::new(Lobby)).unwrap().with_resolver(resolver);
        let (mut client, key) = fake_peer(&mut server, "198.51.100.7");
        settle_lookups(&mut server);

        let conn = server.network().connection(key).unwrap();
        assert_eq!(conn.hostname(), "198.51.100.7");
        assert_eq!(conn.state(), ConnState::Login);
        assert_eq!(server.dns_cache().get("198.51.100.7".parse().unwrap()), Some("198.51.100.7"));
        read_until(&mut server, &mut client, "By what name are you known?");
    }
}

fn read_to_hangup(client: &mut TcpStream) -> String {
    client.set_nonblocking(false).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut raw = vec![];
    client.read_to_end(&mut raw).unwrap();
    String::from_utf8_lossy(&raw).into_owned()
}

#[test]
fn locked_out_sites_are_turned_away_after_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        lockouts: vec!["*.evil.example".to_owned()],
        ..config(dir.path())
    };
    let mut server = Server::new(config, Box::new(Lobby))
        .unwrap()
        .with_resolver(Arc::new(Fixed("shell.evil.example")));
    let (mut client, key) = fake_peer(&mut server, "203.0.113.9");
    settle_lookups(&mut server);

    assert!(server.network().connection(key).is_none());
    let text = read_to_hangup(&mut client);
    assert!(text.contains("You are not wanted here. Begone."));
    assert!(!text.contains("By what name"));
}

#[test]
fn locked_out_sites_are_turned_away_from_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        lockouts: vec!["127.0.0.1".to_owned()],
        ..config(dir.path())
    };
    let mut server = Server::new(config, Box::new(Lobby)).unwrap();
    server.dns_cache_mut().insert(Ipv4Addr::LOCALHOST.into(), "localhost", unix_now());
    let addr = server.add_listen_port(0).unwrap();
    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).unwrap();
    for _ in 0..20 {
        server.pass().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(server.network().is_empty());
    assert!(read_to_hangup(&mut client).contains("You are not wanted here. Begone."));
}

#[test]
fn deleted_sockets_and_shutdown_tear_down_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = server(dir.path(), Box::new(Lobby));
    let (mut alice, _) = connect(&mut server, addr);
    let (mut bob, bob_key) = connect(&mut server, addr);
    alice.write_all(b"Alice\r\n").unwrap();
    bob.write_all(b"Bob\r\n").unwrap();
    read_until(&mut server, &mut alice, "Welcome, Alice.");
    read_until(&mut server, &mut bob, "Welcome, Bob.");
    assert_eq!(server.world().player_count(), 2);

    server.delete_socket(bob_key);
    assert!(server.network().connection(bob_key).is_none());
    assert_eq!(server.world().player_named("bob"), None);
    assert_eq!(server.world().player_count(), 1);
    read_to_hangup(&mut bob);

    server.shutdown("The server is going down.\n");
    assert!(server.network().is_empty());
    assert_eq!(server.world().player_count(), 0);
    assert!(read_to_hangup(&mut alice).contains("The server is going down."));
    assert!(dir.path().join("dns.json").exists());
}

#[test]
fn bind_needs_only_one_port() {
    let busy = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let busy_port = busy.local_addr().unwrap().port();
    let free_port = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap().local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();

    let mut server = Server::new(
        Config {
            ports: vec![busy_port, free_port],
            ..config(dir.path())
        },
        Box::new(Lobby),
    )
    .unwrap();
    server.bind().unwrap();
    assert_eq!(server.network().listener_count(), 1);

    let mut server = Server::new(
        Config {
            ports: vec![busy_port],
            ..config(dir.path())
        },
        Box::new(Lobby),
    )
    .unwrap();
    assert!(matches!(server.bind(), Err(Error::NoListeners)));
    assert_eq!(server.network().listener_count(), 0);
}

#[test]
fn fishing_twice_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = server(dir.path(), Box::new(Lobby));
    let (mut client, _) = connect(&mut server, addr);
    client.write_all(b"Alice\r\neast\r\nfish\r\nfish\r\n").unwrap();
    let text = read_until(&mut server, &mut client, "You are already fishing!");
    assert!(text.contains("Riverbank"));
    assert!(text.contains("You cast your line into the water."));
}

#[test]
fn idle_logins_time_out() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = server(dir.path(), Box::new(Lobby));
    let (mut client, key) = connect(&mut server, addr);
    server.pass_at(unix_now() + 301).unwrap();
    assert!(server.network().connection(key).is_none());

    client.set_nonblocking(false).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut raw = vec![];
    client.read_to_end(&mut raw).unwrap();
    assert!(String::from_utf8_lossy(&raw).contains("Timed out."));
}

#[test]
fn reboot_keeps_players_connected() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = server(dir.path(), Box::new(Lobby));
    let (mut alice, _) = connect(&mut server, addr);
    let (mut bob, _) = connect(&mut server, addr);
    let (mut lurker, _) = connect(&mut server, addr);
    alice.write_all(b"Alice\r\n").unwrap();
    bob.write_all(b"Bob\r\neast\r\n").unwrap();
    read_until(&mut server, &mut alice, "Welcome, Alice.");
    read_until(&mut server, &mut bob, "Riverbank");

    let pulse = server.pulse();
    let manifest = server.into_manifest();
    assert_eq!(manifest.pulse, pulse);
    assert_eq!(manifest.listeners.len(), 1);
    let mut players: Vec<&str> = manifest.connections.iter().map(|c| c.player.as_str()).collect();
    players.sort();
    assert_eq!(players, vec!["Alice", "Bob"]);

    // never got past the name prompt, so it is sent away
    lurker.set_nonblocking(false).unwrap();
    lurker.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut raw = vec![];
    lurker.read_to_end(&mut raw).unwrap();
    assert!(String::from_utf8_lossy(&raw).contains("Sorry, we are rebooting."));

    let path = dir.path().join("reboot.json");
    manifest.save(&path).unwrap();
    let mut server = Server::finish_reboot(config(dir.path()), Box::new(Lobby), &path).unwrap();
    assert!(!path.exists());
    assert_eq!(server.pulse(), pulse);
    read_until(&mut server, &mut alice, "The world comes back into focus!");
    read_until(&mut server, &mut bob, "The world comes back into focus!");

    bob.write_all(b"look\r\n").unwrap();
    read_until(&mut server, &mut bob, "Riverbank");
    alice.write_all(b"who\r\n").unwrap();
    let who = read_until(&mut server, &mut alice, "2 player(s) online.");
    assert!(who.contains("Bob"));

    // the inherited listener still takes new connections
    connect(&mut server, addr);
    assert!(server.pulse() > pulse);
}

#[test]
fn status_page_reports_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        admin_port: Some(0),
        ..config(dir.path())
    };
    let mut server = Server::new(config, Box::new(Lobby)).unwrap();
    let status_addr = server.status_addr().unwrap();
    server.pass().unwrap();

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, status_addr.port())).unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    for _ in 0..20 {
        server.pass().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let status: Status = serde_json::from_str(body).unwrap();
    assert!(status.pulse >= 1);
    assert_eq!(status.connections, 0);
}

#[test]
fn silent_status_clients_do_not_stall_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        admin_port: Some(0),
        ..config(dir.path())
    };
    let mut server = Server::new(config, Box::new(Lobby)).unwrap();
    let status_addr = server.status_addr().unwrap();
    let _silent = TcpStream::connect((Ipv4Addr::LOCALHOST, status_addr.port())).unwrap();
    let _also_silent = TcpStream::connect((Ipv4Addr::LOCALHOST, status_addr.port())).unwrap();
    for _ in 0..10 {
        let started = Instant::now();
        server.pass().unwrap();
        assert!(started.elapsed() < Duration::from_millis(25), "pass took {:?}", started.elapsed());
    }
}

#[test]
fn pulse_counts_every_pass() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, _) = server(dir.path(), Box::new(Lobby));
    for expected in 1..=5 {
        server.pass().unwrap();
        assert_eq!(server.pulse(), expected);
    }
}
