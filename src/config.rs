//! Server configuration.

use crate::error::{Error, Result};
use crate::types::Role;
use crate::world::MonsterTemplate;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Ports to accept players on. At least one has to bind.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Port of the status endpoint, disabled when absent.
    #[serde(default)]
    pub admin_port: Option<u16>,
    /// Length of one reactor pass in milliseconds.
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
    /// New connections past this count are closed on accept.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Threads running blocking helper jobs.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default = "default_reboot_manifest")]
    pub reboot_manifest: PathBuf,
    /// Command run by the `list` helper job, with the player's argument appended.
    #[serde(default = "default_lister_command")]
    pub lister_command: Vec<String>,
    /// Names logging in as staff.
    #[serde(default)]
    pub staff: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    /// Sites turned away on connect. Hostnames or addresses; a leading or
    /// trailing `*` matches any suffix or prefix, and `*` alone matches everyone.
    #[serde(default)]
    pub lockouts: Vec<String>,
    #[serde(default)]
    pub world: WorldConfig,
}

impl Config {
    /// Load configuration from `path`, or use defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|source| Error::Config {
            path: path.to_owned(),
            source,
        })
    }
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }
    pub fn role_for(&self, name: &str) -> Role {
        let listed = |names: &[String]| names.iter().any(|n| n.eq_ignore_ascii_case(name));
        if listed(&self.admins) {
            Role::Admin
        } else if listed(&self.staff) {
            Role::Staff
        } else {
            Role::Player
        }
    }
    pub fn is_locked_out(&self, hostname: &str, ip: IpAddr) -> bool {
        let ip = ip.to_string();
        self.lockouts
            .iter()
            .any(|pattern| site_matches(pattern, hostname) || site_matches(pattern, &ip))
    }
    /// Seconds of silence after which a connection is dropped. `None` for never.
    pub fn idle_timeout(&self, role: Option<Role>) -> Option<u64> {
        match role {
            None => Some(self.timeouts.login),
            Some(Role::Player) => Some(self.timeouts.player),
            Some(Role::Staff) => Some(self.timeouts.staff),
            Some(Role::Admin) => self.timeouts.admin,
        }
    }
}

fn site_matches(pattern: &str, site: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let site = site.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(_), Some(_)) => site.contains(&pattern[1..pattern.len() - 1]),
        (Some(suffix), None) => site.ends_with(suffix),
        (None, Some(prefix)) => site.starts_with(prefix),
        (None, None) => site == pattern,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            admin_port: None,
            pulse_ms: default_pulse_ms(),
            max_connections: default_max_connections(),
            worker_threads: default_worker_threads(),
            timeouts: TimeoutConfig::default(),
            intervals: IntervalConfig::default(),
            dns: DnsConfig::default(),
            reboot_manifest: default_reboot_manifest(),
            lister_command: default_lister_command(),
            staff: vec![],
            admins: vec![],
            lockouts: vec![],
            world: WorldConfig::default(),
        }
    }
}

fn default_ports() -> Vec<u16> {
    vec![3333]
}
fn default_pulse_ms() -> u64 {
    100
}
fn default_max_connections() -> usize {
    1000
}
fn default_worker_threads() -> usize {
    2
}
fn default_reboot_manifest() -> PathBuf {
    PathBuf::from("reboot.json")
}
fn default_lister_command() -> Vec<String> {
    vec!["ls".to_owned(), "-1".to_owned()]
}

/// Idle timeouts in seconds, by who is on the connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_login_timeout")]
    pub login: u64,
    #[serde(default = "default_player_timeout")]
    pub player: u64,
    #[serde(default = "default_staff_timeout")]
    pub staff: u64,
    /// `None` means admins never time out.
    #[serde(default)]
    pub admin: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            login: default_login_timeout(),
            player: default_player_timeout(),
            staff: default_staff_timeout(),
            admin: None,
        }
    }
}

fn default_login_timeout() -> u64 {
    300
}
fn default_player_timeout() -> u64 {
    600
}
fn default_staff_timeout() -> u64 {
    1200
}

/// How often, in seconds, each throttled part of the world update runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntervalConfig {
    #[serde(default = "default_users_interval")]
    pub users: u64,
    #[serde(default = "default_weather_interval")]
    pub weather: u64,
    #[serde(default = "default_random_interval")]
    pub random: u64,
    /// Real seconds per game hour.
    #[serde(default = "default_seconds_per_hour")]
    pub seconds_per_hour: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            users: default_users_interval(),
            weather: default_weather_interval(),
            random: default_random_interval(),
            seconds_per_hour: default_seconds_per_hour(),
        }
    }
}

fn default_users_interval() -> u64 {
    20
}
fn default_weather_interval() -> u64 {
    60
}
fn default_random_interval() -> u64 {
    6
}
fn default_seconds_per_hour() -> u64 {
    150
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_cache")]
    pub cache_path: PathBuf,
    #[serde(default = "default_prune_after")]
    pub prune_after_secs: u64,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_path: default_dns_cache(),
            prune_after_secs: default_prune_after(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

fn default_dns_cache() -> PathBuf {
    PathBuf::from("dns.json")
}
fn default_prune_after() -> u64 {
    60 * 60 * 24 * 15
}
fn default_prune_interval() -> u64 {
    60 * 60 * 24
}

/// Room layout and what lives there.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorldConfig {
    pub rooms: Vec<RoomSpec>,
    /// Name of the room new players start in.
    pub start_room: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoomSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub water: bool,
    /// Exit name to room name.
    #[serde(default)]
    pub exits: Vec<(String, String)>,
    /// Placed once at startup.
    #[serde(default)]
    pub residents: Vec<MonsterTemplate>,
    /// Candidates for random arrivals while players are present.
    #[serde(default)]
    pub spawns: Vec<MonsterTemplate>,
    /// Percent chance per random update that one of `spawns` arrives.
    #[serde(default)]
    pub spawn_chance: u8,
}

impl Default for WorldConfig {
    fn default() -> Self {
        let rat = MonsterTemplate::named("a sewer rat");
        let mut wolf = MonsterTemplate::named("a grey wolf");
        wolf.flags.aggressive = true;
        wolf.flags.night_only = true;
        wolf.damage = 3;
        let mut guard = MonsterTemplate::named("the town guard");
        guard.flags.always_active = true;
        guard.wander_chance = 0;
        Self {
            start_room: "Town Square".to_owned(),
            rooms: vec![
                RoomSpec {
                    name: "Town Square".to_owned(),
                    description: "Cobbles worn smooth by centuries of traffic.".to_owned(),
                    water: false,
                    exits: vec![
                        ("north".to_owned(), "Old Road".to_owned()),
                        ("east".to_owned(), "Riverbank".to_owned()),
                    ],
                    residents: vec![guard],
                    spawns: vec![],
                    spawn_chance: 0,
                },
                RoomSpec {
                    name: "Riverbank".to_owned(),
                    description: "Slow brown water drifts past the reeds.".to_owned(),
                    water: true,
                    exits: vec![("west".to_owned(), "Town Square".to_owned())],
                    residents: vec![],
                    spawns: vec![rat],
                    spawn_chance: 10,
                },
                RoomSpec {
                    name: "Old Road".to_owned(),
                    description: "A rutted track leading away into the hills.".to_owned(),
                    water: false,
                    exits: vec![("south".to_owned(), "Town Square".to_owned())],
                    residents: vec![],
                    spawns: vec![wolf],
                    spawn_chance: 15,
                },
            ],
        }
    }
}
