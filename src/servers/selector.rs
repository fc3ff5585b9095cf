//! Server selection
//!
//! Pure functions over a server list snapshot. Every kind of selection
//! works on the permitted set: servers that are online, within the user's
//! tier, and have at least one online physical host. Lower `Score` wins.

use crate::country::canonical_country_code;
use crate::error::{Error, Result};
use crate::servers::model::{Feature, LogicalServer, PhysicalServer};
use once_cell::sync::Lazy;
use rand::Rng;
use rand::seq::IteratorRandom;
use regex::Regex;
use tracing::debug;

static SERVERNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-z]{2,}(-[a-z]{2})?#\d+(-[a-z]+)?$").expect("server name pattern compiles")
});

/// What the user asked to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerIntent {
    Fastest,
    FastestInCountry(String),
    Name(String),
    Feature(Feature),
    Random,
}

/// `true` for names like `CH-FI#8`, `US#12` or `NL#3-TOR`
pub fn is_servername_valid(name: &str) -> bool {
    SERVERNAME_RE.is_match(name)
}

fn permitted(servers: &[LogicalServer], max_tier: u8) -> impl Iterator<Item = &LogicalServer> {
    servers.iter().filter(move |s| s.is_permitted(max_tier))
}

fn lowest_score<'a>(
    candidates: impl Iterator<Item = &'a LogicalServer>,
    what: &str,
) -> Result<&'a LogicalServer> {
    candidates
        .min_by(|a, b| a.score.total_cmp(&b.score))
        .ok_or_else(|| Error::EmptyServerList(what.to_string()))
}

/// Plain servers only: Secure Core and Tor change routing and are opt-in
fn is_plain(server: &LogicalServer) -> bool {
    !server.has_feature(Feature::SecureCore) && !server.has_feature(Feature::Tor)
}

pub fn fastest(servers: &[LogicalServer], max_tier: u8) -> Result<&LogicalServer> {
    lowest_score(
        permitted(servers, max_tier).filter(|s| is_plain(s)),
        "no server available for your plan",
    )
}

pub fn fastest_in_country<'a>(
    servers: &'a [LogicalServer],
    country_code: &str,
    max_tier: u8,
) -> Result<&'a LogicalServer> {
    let cc = canonical_country_code(country_code);
    lowest_score(
        permitted(servers, max_tier).filter(|s| is_plain(s) && canonical_country_code(&s.exit_country) == cc),
        &format!("no server available in {}", cc),
    )
}

pub fn by_feature(servers: &[LogicalServer], feature: Feature, max_tier: u8) -> Result<&LogicalServer> {
    lowest_score(
        permitted(servers, max_tier).filter(|s| s.has_feature(feature)),
        &format!("no {} server available", feature),
    )
}

pub fn by_name<'a>(servers: &'a [LogicalServer], name: &str, max_tier: u8) -> Result<&'a LogicalServer> {
    if !is_servername_valid(name) {
        return Err(Error::IllegalServername(name.to_string()));
    }
    let server = servers
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

    if server.tier > max_tier {
        return Err(Error::ServerNotFound(format!(
            "{} requires tier {}, your plan is tier {}",
            server.name, server.tier, max_tier
        )));
    }
    if !server.is_permitted(max_tier) {
        return Err(Error::ServerNotFound(format!("{} is under maintenance", server.name)));
    }
    Ok(server)
}

pub fn random<'a, R: Rng + ?Sized>(
    servers: &'a [LogicalServer],
    max_tier: u8,
    rng: &mut R,
) -> Result<&'a LogicalServer> {
    permitted(servers, max_tier)
        .choose(rng)
        .ok_or_else(|| Error::EmptyServerList("no server available for your plan".to_string()))
}

pub fn select<'a, R: Rng + ?Sized>(
    servers: &'a [LogicalServer],
    intent: &ServerIntent,
    max_tier: u8,
    rng: &mut R,
) -> Result<&'a LogicalServer> {
    let server = match intent {
        ServerIntent::Fastest => fastest(servers, max_tier),
        ServerIntent::FastestInCountry(cc) => fastest_in_country(servers, cc, max_tier),
        ServerIntent::Name(name) => by_name(servers, name, max_tier),
        ServerIntent::Feature(feature) => by_feature(servers, *feature, max_tier),
        ServerIntent::Random => random(servers, max_tier, rng),
    }?;
    debug!("Selected {} (score {}) for {:?}", server.name, server.score, intent);
    Ok(server)
}

/// Pick one online physical host uniformly at random
pub fn choose_physical<'a, R: Rng + ?Sized>(
    server: &'a LogicalServer,
    rng: &mut R,
) -> Result<&'a PhysicalServer> {
    server
        .enabled_physical_servers()
        .choose(rng)
        .ok_or_else(|| Error::EmptyServerList(format!("{} has no online hosts", server.name)))
}

pub fn get_server<'a>(servers: &'a [LogicalServer], name: &str) -> Option<&'a LogicalServer> {
    servers.iter().find(|s| s.name.eq_ignore_ascii_case(name))
}

/// `(entry_ip, exit_ip)` of a physical host
pub fn get_server_entry_exit_ip(physical: &PhysicalServer) -> (&str, &str) {
    (&physical.entry_ip, &physical.exit_ip)
}

pub fn get_server_label(physical: &PhysicalServer) -> Option<&str> {
    physical.label()
}
