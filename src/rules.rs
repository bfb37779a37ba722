use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::{debug, trace, warn};

use crate::address::AddressIdentity;
use crate::config::ConfigError;
use crate::dns_resolver::Resolver;
use crate::session::Session;
use crate::socks::AddressType;
use crate::tunnel::{Tunnel, TunnelRegistry};

lazy_static! {
    /// Used when no rule is terminal.
    static ref DEFAULT_ROUTE: Arc<RouteRule> =
        Arc::new(RouteRule::via(vec![Tunnel::Direct], Provenance::builtin()));
}

pub fn default_route() -> Arc<RouteRule> {
    Arc::clone(&DEFAULT_ROUTE)
}

/// IPv4 network in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    pub address: u32,
    pub mask: u32,
}

impl Ipv4Network {
    pub fn new(address: Ipv4Addr, mask: u32) -> Self {
        Self {
            address: u32::from(address),
            mask,
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        (addr & self.mask) == (self.address & self.mask)
    }

    /// Replace the masked bits of `addr` with this network's bits.
    pub fn rewrite(&self, addr: u32) -> u32 {
        (addr & !self.mask) | (self.address & self.mask)
    }

    fn prefix_mask(bits: u8) -> u32 {
        match bits {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n)),
        }
    }
}

impl FromStr for Ipv4Network {
    type Err = ConfigError;

    /// Accepts `a.b.c.d`, `a.b.c.d/nn` or `a.b.c.d/m.m.m.m`. No suffix means /32.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::Invalid(format!("invalid network '{s}'"));
        let (addr, mask) = match s.split_once('/') {
            None => (s, None),
            Some((a, m)) => (a, Some(m)),
        };
        let address: Ipv4Addr = addr.parse().map_err(|_| bad())?;
        let mask = match mask {
            None => u32::MAX,
            Some(m) if m.contains('.') => u32::from(m.parse::<Ipv4Addr>().map_err(|_| bad())?),
            Some(m) => {
                let bits: u8 = m.parse().map_err(|_| bad())?;
                if bits > 32 {
                    return Err(bad());
                }
                Self::prefix_mask(bits)
            }
        };
        Ok(Self::new(address, mask))
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.address), Ipv4Addr::from(self.mask))
    }
}

/// Where a rule was declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub file: String,
    pub line: usize,
}

impl Provenance {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    fn builtin() -> Self {
        Self::new("<default>", 0)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Default)]
pub struct RouteRule {
    pub match_is: Option<String>,
    pub match_starts_with: Option<String>,
    pub match_ends_with: Option<String>,
    pub match_contains: Option<String>,
    /// Zero means no constraint
    pub match_port: Option<u16>,
    pub match_network: Option<Ipv4Network>,
    pub map_rewrite: Option<Ipv4Network>,
    pub to_rewrite: Option<Ipv4Network>,
    pub resolve_dns: bool,
    pub tunnels: Vec<Tunnel>,
    pub provenance: Provenance,
    matches: AtomicU64,
}

/// Destination facts the conditions are tested against.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Facts {
    name: Option<String>,
    ipaddr: Option<String>,
    ipv4: Option<u32>,
    port: u16,
}

impl Facts {
    fn extract(dest: &AddressIdentity) -> Self {
        Self {
            name: dest.hostname.clone(),
            ipaddr: dest.address_string(),
            ipv4: dest.ipv4_u32(),
            port: dest.port,
        }
    }

    fn any_text(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.name.as_deref().is_some_and(&pred) || self.ipaddr.as_deref().is_some_and(&pred)
    }
}

impl RouteRule {
    /// Parse one rule line, e.g. `endsWith .corp.example resolveDNS via corp,direct`.
    pub fn parse(
        line: &str,
        registry: &TunnelRegistry,
        provenance: Provenance,
    ) -> Result<Self, ConfigError> {
        let err = |msg: String| ConfigError::Rule {
            provenance: provenance.to_string(),
            message: msg,
        };

        let mut rule = RouteRule {
            provenance: provenance.clone(),
            ..Default::default()
        };
        let mut tokens = line.split_whitespace();
        while let Some(keyword) = tokens.next() {
            if keyword == "resolveDNS" {
                rule.resolve_dns = true;
                continue;
            }
            let value = tokens
                .next()
                .ok_or_else(|| err(format!("'{keyword}' needs a value")))?;
            match keyword {
                "is" => rule.match_is = Some(value.to_string()),
                "startsWith" => rule.match_starts_with = Some(value.to_string()),
                "endsWith" => rule.match_ends_with = Some(value.to_string()),
                "contains" => rule.match_contains = Some(value.to_string()),
                "port" => {
                    let port = value
                        .parse::<u16>()
                        .map_err(|_| err(format!("invalid port '{value}'")))?;
                    rule.match_port = Some(port);
                }
                "network" => rule.match_network = Some(value.parse().map_err(|e| err(format!("{e}")))?),
                "map" => rule.map_rewrite = Some(value.parse().map_err(|e| err(format!("{e}")))?),
                "to" => rule.to_rewrite = Some(value.parse().map_err(|e| err(format!("{e}")))?),
                "via" => {
                    // Everything after `via` is the tunnel list, split on spaces and commas.
                    let names = std::iter::once(value)
                        .chain(tokens.by_ref())
                        .flat_map(|t| t.split(','))
                        .filter(|n| !n.is_empty());
                    for name in names {
                        let tunnel = registry
                            .lookup(name)
                            .ok_or_else(|| err(format!("unknown tunnel '{name}'")))?;
                        rule.tunnels.push(tunnel);
                    }
                    if rule.tunnels.is_empty() {
                        return Err(err("'via' lists no tunnels".to_string()));
                    }
                }
                other => return Err(err(format!("unknown keyword '{other}'"))),
            }
        }
        Ok(rule)
    }

    /// Unconditional rule routing through `tunnels`.
    pub fn via(tunnels: Vec<Tunnel>, provenance: Provenance) -> Self {
        Self {
            tunnels,
            provenance,
            ..Default::default()
        }
    }

    pub fn is_terminal_candidate(&self) -> bool {
        !self.tunnels.is_empty()
    }

    pub fn match_count(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }

    pub fn tunnel_names(&self) -> Vec<&str> {
        self.tunnels.iter().map(Tunnel::name).collect()
    }

    fn conditions_hold(&self, facts: &Facts) -> bool {
        if let Some(s) = &self.match_is {
            if !facts.any_text(|v| v == s.as_str()) {
                return false;
            }
        }
        if let Some(s) = &self.match_starts_with {
            if !facts.any_text(|v| v.starts_with(s.as_str())) {
                return false;
            }
        }
        if let Some(s) = &self.match_ends_with {
            if !facts.any_text(|v| v.ends_with(s.as_str())) {
                return false;
            }
        }
        if let Some(s) = &self.match_contains {
            if !facts.any_text(|v| v.contains(s.as_str())) {
                return false;
            }
        }
        if let Some(port) = self.match_port {
            if port != 0 && port != facts.port {
                return false;
            }
        }
        for net in [&self.match_network, &self.map_rewrite].into_iter().flatten() {
            match facts.ipv4 {
                Some(addr) if net.contains(addr) => {}
                _ => return false,
            }
        }
        true
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        for (kw, v) in [
            ("is", &self.match_is),
            ("startsWith", &self.match_starts_with),
            ("endsWith", &self.match_ends_with),
            ("contains", &self.match_contains),
        ] {
            if let Some(v) = v {
                parts.push(format!("{kw} {v}"));
            }
        }
        if let Some(p) = self.match_port {
            parts.push(format!("port {p}"));
        }
        for (kw, v) in [
            ("network", &self.match_network),
            ("map", &self.map_rewrite),
            ("to", &self.to_rewrite),
        ] {
            if let Some(v) = v {
                parts.push(format!("{kw} {v}"));
            }
        }
        if self.resolve_dns {
            parts.push("resolveDNS".to_string());
        }
        if !self.tunnels.is_empty() {
            parts.push(format!("via {}", self.tunnel_names().join(",")));
        }
        write!(f, "{} ({})", parts.join(" "), self.provenance)
    }
}

/// Parse a rules file body. Blank lines and `#` comments are skipped;
/// provenance carries the real line number.
pub fn parse_rule_lines(
    text: &str,
    file: &str,
    registry: &TunnelRegistry,
) -> Result<Vec<RouteRule>, ConfigError> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let line = line.split('#').next().unwrap_or("").trim();
            (!line.is_empty()).then(|| (idx + 1, line))
        })
        .map(|(line_no, line)| RouteRule::parse(line, registry, Provenance::new(file, line_no)))
        .collect()
}

pub struct RouteDecision {
    pub route: Arc<RouteRule>,
    /// False when the default direct route was used
    pub explicit_match: bool,
}

/// Ordered, immutable rule list plus the resolver used by `resolveDNS`.
pub struct RouteRuleEngine {
    rules: Arc<[Arc<RouteRule>]>,
    resolver: Arc<dyn Resolver>,
}

impl RouteRuleEngine {
    pub fn new(rules: Vec<RouteRule>, resolver: Arc<dyn Resolver>) -> Self {
        let rules: Vec<Arc<RouteRule>> = rules.into_iter().map(Arc::new).collect();
        Self {
            rules: rules.into(),
            resolver,
        }
    }

    pub fn rules(&self) -> &[Arc<RouteRule>] {
        &self.rules
    }

    /// Walk the rules in order and assign `session.route`.
    ///
    /// Rewrites and DNS resolution from applying rules stay in the session's
    /// destination even when that rule is not terminal, so later rules see
    /// the transformed destination.
    pub async fn decide(&self, session: &Session) -> RouteDecision {
        let mut facts = Facts::extract(&session.destination());
        let mut chosen = None;

        for rule in self.rules.iter() {
            if !rule.conditions_hold(&facts) {
                trace!(rule = %rule, "rule does not apply");
                continue;
            }
            debug!(rule = %rule, "rule applies");

            if let Some(to) = &rule.to_rewrite {
                let mut st = session.lock();
                match st.destination.ipv4_u32() {
                    Some(addr) => {
                        let rewritten = to.rewrite(addr);
                        st.destination.with_ipv4_u32(rewritten);
                        st.address_type = Some(AddressType::Ipv4);
                        debug!(
                            from = %Ipv4Addr::from(addr),
                            to = %Ipv4Addr::from(rewritten),
                            "rewrote destination"
                        );
                        facts = Facts::extract(&st.destination);
                    }
                    None => debug!("rewrite skipped, destination has no IPv4 address"),
                }
            }

            if rule.resolve_dns {
                let target = session.destination();
                match self.resolver.resolve(&target).await {
                    Ok(resolved) => {
                        let mut st = session.lock();
                        st.destination = resolved;
                        facts = Facts::extract(&st.destination);
                    }
                    Err(e) => warn!(rule = %rule.provenance, "DNS resolution failed: {}", e),
                }
            }

            if rule.is_terminal_candidate() {
                rule.matches.fetch_add(1, Ordering::Relaxed);
                chosen = Some(Arc::clone(rule));
                break;
            }
        }

        let decision = match chosen {
            Some(route) => RouteDecision {
                route,
                explicit_match: true,
            },
            None => RouteDecision {
                route: default_route(),
                explicit_match: false,
            },
        };
        session.lock().route = Some(Arc::clone(&decision.route));
        decision
    }
}
