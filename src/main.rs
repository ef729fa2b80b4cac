use clap::Parser;
use mudserv::commands::Lobby;
use mudserv::{Config, Server};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "A MUD server")]
struct Args {
    /// JSON configuration file. Defaults apply when it does not exist.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Listen on this port instead of the configured ones. May be repeated.
    #[arg(long = "port")]
    ports: Vec<u16>,
    /// Resume from the manifest a rebooting server left behind.
    #[arg(long, value_name = "MANIFEST")]
    reboot: Option<PathBuf>,
}

impl Args {
    /// What the next image needs to come up with the same settings.
    fn exec_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--config"), self.config.clone().into_os_string()];
        for port in &self.ports {
            args.push("--port".into());
            args.push(port.to_string().into());
        }
        args
    }
}

fn main() -> mudserv::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if !args.ports.is_empty() {
        config.ports = args.ports.clone();
    }

    let mut server = match &args.reboot {
        Some(path) => Server::finish_reboot(config, Box::new(Lobby), path)?,
        None => {
            let mut server = Server::new(config, Box::new(Lobby))?;
            server.bind()?;
            server
        }
    };
    server.set_exec_args(args.exec_args());
    server.install_signal_handlers()?;
    log::info!("running at pulse {}", server.pulse());
    server.run()
}
