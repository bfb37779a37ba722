mod address;
mod config;
mod connector;
mod dns_resolver;
mod error;
mod handler;
mod logging;
mod rules;
mod server;
mod service;
mod session;
mod shuttle;
mod socks;
mod status;
mod supervisor;
mod teardown;
mod tunnel;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::config::{load_config, ConfigError, DnsSettings, ProxyConfig, ResolverKind, ServiceSpec, TunnelSpec};
use crate::connector::{RetryPolicy, TunnelConnector};
use crate::dns_resolver::{DohResolver, Resolver, SystemResolver};
use crate::handler::ProxyContext;
use crate::rules::{Provenance, RouteRule, RouteRuleEngine};
use crate::server::{Server, SessionRegistry};
use crate::shuttle::Shuttle;
use crate::supervisor::Supervisor;
use crate::tunnel::TunnelRegistry;

const CLI_RULES: &str = "<command line>";

/// Policy-routed SOCKS proxy
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// SOCKS4/5 listener, [bind:]port
    #[arg(long = "socks")]
    socks: Vec<String>,
    /// Static port forward, [bind:]lport:rhost:rport
    #[arg(long = "forward")]
    forward: Vec<String>,
    /// Chained tunnel, name:socksport:command
    #[arg(long = "tunnel")]
    tunnel: Vec<String>,
    /// Route rule, appended after the configured rules
    #[arg(long = "rule")]
    rule: Vec<String>,
    /// Log filter directive, e.g. "debug" or "routed_socks_proxy=trace"
    #[arg(long = "log-level")]
    log_level: Option<String>,
    /// Do not start tunnel commands
    #[arg(long = "no-supervisor", default_value_t = false)]
    no_supervisor: bool,
}

impl Args {
    fn merge_into(&self, config: &mut ProxyConfig) -> Result<(), ConfigError> {
        for s in &self.socks {
            config.services.push(ServiceSpec::parse_socks(s)?);
        }
        for s in &self.forward {
            config.services.push(ServiceSpec::parse_forward(s)?);
        }
        for s in &self.tunnel {
            config.tunnels.push(s.parse::<TunnelSpec>()?);
        }
        if self.no_supervisor {
            config.supervisor.enabled = false;
        }
        Ok(())
    }
}

fn build_resolver(dns: &DnsSettings) -> Arc<dyn Resolver> {
    match (dns.resolver, &dns.doh_url) {
        (ResolverKind::Doh, Some(url)) => Arc::new(DohResolver::new(url.clone())),
        _ => Arc::new(SystemResolver::new(dns.retries)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    logging::init(&logging::directive(
        args.log_level.as_deref(),
        config.log_level.as_deref(),
    ));

    args.merge_into(&mut config)?;
    config.validate()?;

    let registry = TunnelRegistry::from_specs(&config.tunnels)?;
    let mut rules = config.load_rules(&registry)?;
    for (i, line) in args.rule.iter().enumerate() {
        rules.push(RouteRule::parse(line, &registry, Provenance::new(CLI_RULES, i + 1))?);
    }

    let resolver = build_resolver(&config.dns);
    let engine = RouteRuleEngine::new(rules, Arc::clone(&resolver));
    info!(
        rules = engine.rules().len(),
        tunnels = registry.chained().len(),
        resolver = resolver.name(),
        "routing table ready"
    );

    let ctx = Arc::new(ProxyContext {
        engine,
        connector: TunnelConnector::new(RetryPolicy::from(&config.connect), resolver),
        shuttle: Shuttle::from(&config.relay),
        handshake_timeout: config.relay.handshake_timeout(),
    });

    let sessions = Arc::new(SessionRegistry::default());
    let server = Server::bind(
        ctx,
        &config.services,
        Arc::clone(&sessions),
        config.session_loiter(),
    )
    .await?;

    if config.supervisor.enabled {
        let supervisor = Supervisor::new(registry.chained(), Arc::clone(&sessions), &config.supervisor);
        tokio::spawn(supervisor.run());
    } else if registry.chained().iter().any(|t| t.command().is_some()) {
        warn!("supervisor disabled; tunnel commands will not be started");
    }

    tokio::select! {
        _ = server.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}
