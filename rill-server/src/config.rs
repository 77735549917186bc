//! Command-line configuration.

use std::collections::HashSet;
use std::fmt;

use clap::Parser;

// ─── Raw flags ───────────────────────────────────────────────────────────────

/// Raw command-line flags, before range validation.
#[derive(Parser, Debug)]
#[command(name = "rilld", about = "RTMFP rendezvous and relay server", version)]
pub struct Args {
    /// Maximum number of CPUs, in [1, 1024].
    #[arg(long, default_value_t = 1)]
    pub ncpu: usize,

    /// Parallel receive workers per UDP listener, in [1, 1024].
    #[arg(long, default_value_t = 32)]
    pub parallel: usize,

    /// RTMFP UDP listen ports, comma-separated (e.g. "1935,1936").
    #[arg(long, default_value = "1935")]
    pub rtmfp: String,

    /// TCP RPC bridge listen port.
    #[arg(long, default_value = "")]
    pub listen: String,

    /// Peer RPC bridge to dial, as host:port.
    #[arg(long, default_value = "")]
    pub remote: String,

    /// Session management tick interval in milliseconds, in [100, 10000].
    #[arg(long, default_value_t = 500)]
    pub manage: u64,

    /// Retransmission intervals in milliseconds, comma-separated,
    /// each in [100, 30000].
    #[arg(long, default_value = "500,500,1000,1500,1500,2500,3000,4000,5000,7500,10000,15000")]
    pub retrans: String,

    /// HTTP status endpoint port.
    #[arg(long, default_value = "")]
    pub http: String,

    /// Allowed application names, comma-separated.
    #[arg(long, default_value = "")]
    pub apps: String,

    /// Server keepalive interval in seconds, in [1, 60].
    #[arg(long, default_value_t = 60)]
    pub heartbeat: u64,

    /// Mirror debug logs to stdout.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

// ─── Validated configuration ─────────────────────────────────────────────────

/// Validated server configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Tokio worker threads.
    pub ncpu: usize,
    /// Receive workers per UDP listener.
    pub parallel: usize,
    /// UDP listen ports.
    pub udp_ports: Vec<u16>,
    /// TCP bridge listen port, if serving.
    pub rpc_listen: Option<u16>,
    /// Peer bridge address, if dialing.
    pub rpc_remote: Option<(String, u16)>,
    /// Session tick interval (ms).
    pub manage_ms: u64,
    /// Retransmission back-off schedule (ms).
    pub retrans_ms: Vec<u64>,
    /// HTTP status port, if enabled.
    pub http_port: Option<u16>,
    /// Allowed application names.
    pub apps: HashSet<String>,
    /// Server keepalive interval (s).
    pub heartbeat_s: u64,
    /// Mirror debug logs to stdout.
    pub debug: bool,
}

/// A rejected flag value.
#[derive(Debug)]
pub struct ConfigError {
    flag: &'static str,
    detail: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid --{} = {}", self.flag, self.detail)
    }
}

impl std::error::Error for ConfigError {}

fn bad(flag: &'static str, detail: impl fmt::Display) -> ConfigError {
    ConfigError { flag, detail: detail.to_string() }
}

fn parse_port(flag: &'static str, s: &str) -> Result<u16, ConfigError> {
    match s.trim().parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(bad(flag, format!("'{s}' (expected a nonzero port)"))),
    }
}

fn parse_ports(flag: &'static str, s: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        ports.push(parse_port(flag, part)?);
    }
    Ok(ports)
}

impl Config {
    /// Validate raw flags, rejecting out-of-range values.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.ncpu < 1 || args.ncpu > 1024 {
            return Err(bad("ncpu", args.ncpu));
        }
        if args.parallel < 1 || args.parallel > 1024 {
            return Err(bad("parallel", args.parallel));
        }

        let udp_ports = parse_ports("rtmfp", &args.rtmfp)?;
        if udp_ports.is_empty() {
            return Err(bad("rtmfp", format!("'{}' (no ports)", args.rtmfp)));
        }

        let rpc_listen = match args.listen.trim() {
            "" => None,
            s => Some(parse_port("listen", s)?),
        };

        let rpc_remote = match args.remote.trim() {
            "" => None,
            s => {
                let (host, port) = s
                    .rsplit_once(':')
                    .ok_or_else(|| bad("remote", format!("'{s}' (expected host:port)")))?;
                if host.is_empty() {
                    return Err(bad("remote", format!("'{s}' (empty host)")));
                }
                Some((host.to_owned(), parse_port("remote", port)?))
            }
        };

        if !(100..=10_000).contains(&args.manage) {
            return Err(bad("manage", args.manage));
        }
        if !(1..=60).contains(&args.heartbeat) {
            return Err(bad("heartbeat", args.heartbeat));
        }

        let mut retrans_ms = Vec::new();
        for part in args.retrans.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let v: u64 = part
                .parse()
                .map_err(|_| bad("retrans", format!("'{part}'")))?;
            if !(100..=30_000).contains(&v) {
                return Err(bad("retrans", v));
            }
            retrans_ms.push(v);
        }
        if retrans_ms.is_empty() {
            return Err(bad("retrans", format!("'{}' (no intervals)", args.retrans)));
        }

        let http_port = match args.http.trim() {
            "" => None,
            s => Some(parse_port("http", s)?),
        };

        let apps = args
            .apps
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(Self {
            ncpu: args.ncpu,
            parallel: args.parallel,
            udp_ports,
            rpc_listen,
            rpc_remote,
            manage_ms: args.manage,
            retrans_ms,
            http_port,
            apps,
            heartbeat_s: args.heartbeat,
            debug: args.debug,
        })
    }

    /// True if `app` is in the allowed set.
    pub fn is_authorized_app(&self, app: &str) -> bool {
        self.apps.contains(app)
    }
}
