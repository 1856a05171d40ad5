use std::path::PathBuf;

use anyhow::Context;
use direct_protocol::{PeerAddress, Role, parse_ip_and_port};

pub(crate) const DEFAULT_CONFIG_PATH: &str = "direct.toml";

/// What the process should do once the endpoint is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// Caller: dial this address.
    Dial(PeerAddress),
    /// Callee: listen on this port on all interfaces.
    Listen(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Args {
    pub mode: Role,
    pub target: Target,
    pub encryption: bool,
    pub config_path: PathBuf,
    pub self_test: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Parsed {
    Run(Args),
    Help,
    Version,
}

impl Args {
    /// Effective options, logged once at start-up.
    pub fn summary(&self) -> String {
        let target = match &self.target {
            Target::Dial(addr) => format!("dial {addr}"),
            Target::Listen(port) => format!("listen on :{port}"),
        };
        format!(
            "mode={} target=\"{}\" encryption={} (advisory) config={} self_test={}",
            self.mode,
            target,
            if self.encryption { "enabled" } else { "disabled" },
            self.config_path.display(),
            self.self_test
        )
    }
}

pub(crate) fn print_usage() {
    println!("direct - peer-to-peer call signaling over TCP");
    println!();
    println!("USAGE:");
    println!("    direct [OPTIONS] <ADDRESS>");
    println!();
    println!("ADDRESS:");
    println!("    caller: host:port, http://host[:port][/path] or https://host[/path]");
    println!("    callee: :port");
    println!();
    println!("OPTIONS:");
    println!("    --mode=<caller|callee>          Operation mode [default: caller]");
    println!("    --encryption, --no-encryption   Advisory only: media always runs DTLS-SRTP");
    println!("                                    [default: disabled, logs a warning]");
    println!("    --config <PATH>                 TOML config file [default: direct.toml]");
    println!("    --self-test                     Run the ICE/SDP counting exchange");
    println!("    -V, --version                   Print version and exit");
    println!("    -h, --help                      Print this help and exit");
    println!();
    println!("EXAMPLES:");
    println!("    direct --mode=caller 192.168.1.100:3478 --encryption");
    println!("    direct --mode=callee :3478 --no-encryption");
}

pub(crate) fn parse_args() -> anyhow::Result<Parsed> {
    let args: Vec<String> = std::env::args().collect();
    parse(&args)
}

/// Parse a full argv (program name first). Options and the address may
/// appear in any order.
pub(crate) fn parse(args: &[String]) -> anyhow::Result<Parsed> {
    let mut mode = Role::Caller;
    let mut address: Option<String> = None;
    let mut encryption = false;
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut self_test = false;

    if args.len() <= 1 {
        anyhow::bail!("No arguments given, see --help");
    }

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-V" | "--version" => return Ok(Parsed::Version),
            "-h" | "--help" => return Ok(Parsed::Help),
            "--mode" => {
                i += 1;
                mode = parse_mode(args.get(i).context("Missing --mode value")?)?;
            }
            "--encryption" => encryption = true,
            "--no-encryption" => encryption = false,
            "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--self-test" => self_test = true,
            other => {
                if let Some(value) = other.strip_prefix("--mode=") {
                    mode = parse_mode(value)?;
                } else if let Some(value) = other.strip_prefix("--config=") {
                    config_path = PathBuf::from(value);
                } else if other.starts_with('-') {
                    anyhow::bail!("Unknown argument: {other}");
                } else if let Some(previous) = &address {
                    anyhow::bail!("Unexpected second address {other} (already have {previous})");
                } else {
                    address = Some(other.to_string());
                }
            }
        }
        i += 1;
    }

    let address = address.context("An address is required (host:port or :port)")?;
    let target = match mode {
        Role::Caller => Target::Dial(
            PeerAddress::parse(&address)
                .with_context(|| format!("Invalid caller address {address}"))?,
        ),
        Role::Callee => {
            let (_, port) = parse_ip_and_port(&address)
                .with_context(|| format!("Invalid callee address {address}"))?;
            Target::Listen(port)
        }
    };

    Ok(Parsed::Run(Args {
        mode,
        target,
        encryption,
        config_path,
        self_test,
    }))
}

fn parse_mode(value: &str) -> anyhow::Result<Role> {
    value
        .parse::<Role>()
        .map_err(|e| anyhow::anyhow!("Invalid --mode value: {e}"))
}
