//! Engine assembly: registries, pools, listeners, background loops.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::cookies::CookieStore;
use crate::counts::Counts;
use crate::fabric::Fabric;
use crate::handshake::{self, HandshakePool};
use crate::session::{PublicationRegistry, SessionRegistry};
use crate::tcp::{self, BridgeClient};
use crate::udp::UdpHub;
use crate::util::unix_ms;
use crate::{http, rpc, udp};

/// Everything the workers share.
pub struct Engine {
    pub cfg: Config,
    pub counts: Arc<Counts>,
    pub fabric: Fabric,
    pub cookies: Arc<CookieStore>,
    pub sessions: SessionRegistry,
    pub(crate) streams: PublicationRegistry,
    pub handshakes: Arc<HandshakePool>,
    pub udp: UdpHub,
    /// The dialing side of the RPC bridge, if `--remote` was given.
    pub bridge: Option<BridgeClient>,
    /// The server certificate blob sent in Hello responses.
    pub certificate: Vec<u8>,
    pub boot_unix_s: u64,
}

impl Engine {
    /// Bind sockets, build the registries and spawn every background
    /// task. Must run inside the tokio runtime.
    pub fn start(cfg: Config) -> io::Result<Arc<Engine>> {
        let counts = Arc::new(Counts::new());
        let cookies = Arc::new(CookieStore::new());
        let handshakes = Arc::new(HandshakePool::new());

        let (udp_hub, udp_sockets) = UdpHub::bind(&cfg.udp_ports)?;

        let (bridge, bridge_rx) = match &cfg.rpc_remote {
            Some((host, port)) => {
                let (client, rx) =
                    BridgeClient::start(host.clone(), *port, Arc::clone(&counts));
                (Some(client), Some(rx))
            }
            None => (None, None),
        };
        let server_rx = cfg
            .rpc_listen
            .map(|port| tcp::start_server(port, Arc::clone(&counts)));

        let eng = Arc::new(Engine {
            counts,
            fabric: Fabric::start(),
            cookies,
            sessions: SessionRegistry::new(),
            streams: PublicationRegistry::new(),
            handshakes,
            udp: udp_hub,
            bridge,
            certificate: handshake::build_certificate(),
            boot_unix_s: unix_ms() / 1000,
            cfg,
        });

        // Background loops.
        eng.cookies.start_sweeper(Arc::clone(&eng.counts));
        eng.handshakes.start_shrinker(Arc::clone(&eng.counts));
        SessionRegistry::start_manage(&eng);
        udp::spawn_workers(&eng, udp_sockets, eng.cfg.parallel);
        if let Some(rx) = bridge_rx {
            rpc::start_client_loop(Arc::clone(&eng), rx);
        }
        if let Some(rx) = server_rx {
            rpc::start_server_loop(Arc::clone(&eng), rx);
        }
        if let Some(port) = eng.cfg.http_port {
            http::start(Arc::clone(&eng), port);
        }

        let counts = Arc::clone(&eng.counts);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                counts.aggregate();
            }
        });

        Ok(eng)
    }
}
