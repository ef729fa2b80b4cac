//! Hot reboot: the state handed from one server image to the next.
//!
//! Sockets survive `exec` as inherited descriptors. Everything else needed to
//! pick them back up goes into a JSON manifest the new image reads on start.

use crate::error::{Error, Result};
use crate::network::telnet::Telopts;
use crate::types::Role;
use crate::world::WorldTimers;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerEntry {
    pub port: u16,
    pub fd: RawFd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub fd: RawFd,
    pub ip: IpAddr,
    pub hostname: String,
    pub player: String,
    pub role: Role,
    /// Room name; rooms are rebuilt from configuration so ids don't carry over.
    pub room: Option<String>,
    pub telopts: Telopts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub pulse: u64,
    pub start_time: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub timers: WorldTimers,
    pub listeners: Vec<ListenerEntry>,
    pub connections: Vec<ConnectionEntry>,
}

impl Manifest {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::Manifest {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, json)?;
        log::info!(
            "wrote reboot manifest {} ({} connections)",
            path.display(),
            self.connections.len()
        );
        Ok(())
    }
    /// Reads the manifest and removes the file.
    pub fn load(path: &Path) -> Result<Self> {
        let manifest_error = |reason: String| Error::Manifest {
            path: path.to_owned(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| manifest_error(e.to_string()))?;
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("unable to remove reboot manifest {}: {e}", path.display());
        }
        serde_json::from_str(&contents).map_err(|e| manifest_error(e.to_string()))
    }
    pub fn descriptors(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.listeners
            .iter()
            .map(|l| l.fd)
            .chain(self.connections.iter().map(|c| c.fd))
    }
}

/// Lets `fd` survive `exec`.
pub fn inherit(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only read and write the descriptor's flag word.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Replaces the process with a fresh copy of the current executable. Only returns on failure.
pub fn exec(manifest: &Path, args: &[OsString]) -> Error {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return Error::Exec(e),
    };
    log::info!("exec {} --reboot {}", exe.display(), manifest.display());
    let err = Command::new(exe).args(args).arg("--reboot").arg(manifest).exec();
    Error::Exec(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{Calendar, Throttle, Weather};
    use std::os::fd::AsRawFd;

    fn manifest() -> Manifest {
        Manifest {
            pulse: 1234,
            start_time: 1_700_000_000,
            in_bytes: 10,
            out_bytes: 20,
            timers: WorldTimers {
                calendar: Calendar { hour: 21 },
                weather: Weather::Rain,
                hour: Throttle { interval: 150, last: 5 },
                weather_update: Throttle { interval: 60, last: 6 },
                random_update: Throttle { interval: 6, last: 7 },
            },
            listeners: vec![ListenerEntry { port: 3333, fd: 3 }],
            connections: vec![ConnectionEntry {
                fd: 7,
                ip: "203.0.113.5".parse().unwrap(),
                hostname: "host.example.com".to_owned(),
                player: "Alice".to_owned(),
                role: Role::Staff,
                room: Some("Riverbank".to_owned()),
                telopts: Telopts {
                    compress: true,
                    ..Telopts::default()
                },
            }],
        }
    }

    #[test]
    fn load_consumes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reboot.json");
        manifest().save(&path).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), manifest());
        assert!(!path.exists());
        assert!(matches!(Manifest::load(&path), Err(Error::Manifest { .. })));
    }

    #[test]
    fn descriptors_cover_listeners_and_connections() {
        assert_eq!(manifest().descriptors().collect::<Vec<_>>(), vec![3, 7]);
    }

    #[test]
    fn inherit_clears_close_on_exec() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        inherit(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }
}
