//! Lantern Daemon
//!
//! Assembles the node from its configuration: trust root, certificate,
//! firewall, TUN device, UDP listener pool, host map, lighthouse,
//! handshake manager and the forwarding interface, then runs until a
//! signal or an `exit` command arrives.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lantern_core::cert::{ca_handle, CaPool, CertState, Certificate};
use lantern_core::config::Config;
use lantern_core::control::{run_command_loop, Command, CommandRequest};
use lantern_core::firewall::Firewall;
use lantern_core::handshake_manager::HandshakeManager;
use lantern_core::hostmap::HostMap;
use lantern_core::interface::{Interface, InterfaceConfig};
use lantern_core::lighthouse::Lighthouse;
use lantern_crypto::PrivateKey;
use lantern_network::tun::TunDevice;
use lantern_network::udp::UdpListenerPool;

/// Lantern - overlay mesh VPN node
#[derive(Parser)]
#[command(name = "lanternd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: PathBuf,

    /// Validate the config and exit
    #[arg(short = 't', long)]
    config_test: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    // Startup failures produce one diagnostic line and a non-zero exit
    if let Err(e) = run(cli) {
        eprintln!("lanternd: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run_node(cli))
}

async fn run_node(cli: Cli) -> Result<()> {
    let source = tokio::fs::read_to_string(&cli.config)
        .await
        .with_context(|| format!("failed to read config {:?}", cli.config))?;
    let (config, warnings) = Config::from_toml(&source).context("failed to parse config")?;
    for warning in warnings {
        warn!("{}", warning);
    }

    // Trust root and identity
    let ca = load_ca(&config.pki.ca).await.context("failed to load ca")?;
    debug!(fingerprints = ?ca.fingerprints(), "trusted CA fingerprints");
    let ca = ca_handle(ca);

    let cert_bytes = tokio::fs::read(&config.pki.cert)
        .await
        .with_context(|| format!("failed to read certificate {}", config.pki.cert))?;
    let certificate =
        Certificate::decode(&cert_bytes).context("failed to decode certificate")?;

    let key_bytes = tokio::fs::read(&config.pki.key)
        .await
        .with_context(|| format!("failed to read key {}", config.pki.key))?;
    let key: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .context("private key must be exactly 32 bytes")?;

    let cert_state = Arc::new(
        CertState::new(certificate, PrivateKey::from_bytes(key), ca)
            .context("failed to load certificate state")?,
    );
    let subnet = cert_state.subnet().context("certificate carries no subnet")?;
    debug!(cert = cert_state.certificate.name, vpn_ip = %cert_state.vpn_ip(), "node certificate");

    // Firewall
    let rules = config.build_ruleset().context("error while loading firewall rules")?;
    info!(firewall_hash = rules.rule_hash(), "firewall started");
    let firewall = Arc::new(Firewall::new(rules));

    config.validate(subnet).context("invalid config")?;

    let suite = config.cipher_suite().context("invalid cipher")?;
    let (preferred_ranges, deprecated) = config.preferred_ranges()?;
    if deprecated {
        warn!("local_range is deprecated, use preferred_ranges");
    }

    if cli.config_test {
        println!("config ok");
        return Ok(());
    }

    // Everything below modifies the system
    let inside = open_tun(&config, cert_state.vpn_ip().to_ipv4(), subnet)?;

    let outside = Arc::new(
        UdpListenerPool::listen(
            &config.listen.host,
            config.listen.port,
            config.listen.routines,
            config.listen.routines > 1,
        )
        .await
        .context("failed to open udp listener")?,
    );
    outside
        .reload(config.listen.read_buffer, config.listen.write_buffer)
        .await;
    let port = outside.local_addr().port();
    info!(addr = %outside.local_addr(), "udp listener bound");

    // Host map and routing
    let hostmap = Arc::new(HostMap::new("main", subnet, preferred_ranges.clone()));
    hostmap.set_default_route(config.default_route()?).await;
    for (route, via) in config.unsafe_routes(subnet)? {
        hostmap.add_unsafe_route(route, via).await;
    }
    info!(network = %subnet, ?preferred_ranges, "main host map created");

    // Lighthouse
    let static_map = config.static_host_map(subnet)?;
    let mut lighthouse = Lighthouse::new(
        config.lighthouse.am_lighthouse,
        cert_state.vpn_ip(),
        config.lighthouse_hosts(subnet)?,
        std::time::Duration::from_secs(config.lighthouse.interval.max(1)),
        std::time::Duration::from_secs(lantern_core::DEFAULT_LIGHTHOUSE_TTL_SECS),
        port,
        config.punch_settings(),
        outside.clone(),
        hostmap.clone(),
    );
    lighthouse.set_remote_allow_list(config.remote_allow_list()?);
    lighthouse.set_local_allow_list(config.local_allow_list()?);
    let lighthouse = Arc::new(lighthouse);

    for (vpn_ip, endpoints) in &static_map {
        lighthouse.add_static(*vpn_ip, endpoints.clone()).await;
    }
    if let Err(e) = lighthouse.validate_static_entries().await {
        warn!(error = %e, "lighthouse unreachable");
    }

    // Advertise the bind address when it is concrete; enumeration of
    // interface addresses is left to the embedding host
    if let Ok(IpAddr::V4(addr)) = config.listen.host.parse::<IpAddr>() {
        if !addr.is_unspecified() {
            lighthouse.set_local_addresses(vec![addr]).await;
        }
    }

    // Handshake manager and interface
    let handshake_manager = HandshakeManager::new(
        hostmap.clone(),
        lighthouse.clone(),
        outside.clone(),
        cert_state.clone(),
        suite,
        config.handshake_settings(),
        static_map,
    );

    let interface = Interface::new(InterfaceConfig {
        hostmap: hostmap.clone(),
        inside,
        outside: outside.clone(),
        cert_state,
        firewall,
        handshake_manager: handshake_manager.clone(),
        lighthouse: lighthouse.clone(),
        check_interval: std::time::Duration::from_secs(config.timers.connection_alive_interval.max(1)),
        pending_deletion_interval: std::time::Duration::from_secs(
            config.timers.pending_deletion_interval.max(1),
        ),
        drop_local_broadcast: config.tun.drop_local_broadcast,
        drop_multicast: config.tun.drop_multicast,
        tun_routines: config.tun.routines,
        udp_routines: config.listen.routines,
        udp_batch: config.listen.batch,
    });

    let _handshake_worker = handshake_manager.start();
    let _lighthouse_worker = lighthouse.start_update_worker();
    if config.punchy.punch {
        info!("udp hole punching enabled");
        let _punchy = hostmap.start_punchy(outside.clone(), std::time::Duration::from_secs(10));
    }
    interface.run().await;

    // Command channel and signal handling
    let (command_tx, command_rx) = mpsc::channel::<CommandRequest>(4);
    let control = tokio::spawn(run_command_loop(
        command_rx,
        interface.clone(),
        outside.clone(),
    ));

    wait_for_shutdown().await;
    info!("caught signal, shutting down");

    let (request, reply) = CommandRequest::new(Command::Exit);
    if command_tx.send(request).await.is_ok() {
        let _ = reply.await;
    }
    let _ = control.await;

    info!("goodbye");
    Ok(())
}

/// Trusted CA fingerprints, one per line, `#` comments allowed
async fn load_ca(path: &str) -> Result<CaPool> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read ca file {}", path))?;

    let fingerprints: Vec<String> = content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect();

    if fingerprints.is_empty() {
        bail!("ca file {} holds no fingerprints", path);
    }
    Ok(CaPool::new(fingerprints))
}

#[cfg(target_os = "linux")]
fn open_tun(
    config: &Config,
    address: Ipv4Addr,
    subnet: ipnet::Ipv4Net,
) -> Result<Arc<dyn TunDevice>> {
    use lantern_network::tun::linux::{LinuxTun, TunOptions};

    let device = LinuxTun::open(TunOptions {
        name: config.tun.dev.clone(),
        address,
        netmask: subnet.netmask(),
        mtu: config.tun.mtu,
    })
    .context("failed to get a tun device")?;
    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_tun(
    _config: &Config,
    _address: Ipv4Addr,
    _subnet: ipnet::Ipv4Net,
) -> Result<Arc<dyn TunDevice>> {
    bail!("no tun driver for this platform; embed the engine with your own device")
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
