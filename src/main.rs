//! protonvpn CLI

use clap::{Args, Parser, Subcommand};
use protonvpn::connection::ConnectionMetadata;
use protonvpn::country::extract_country_name;
use protonvpn::servers::{Feature, LogicalServer};
use protonvpn::settings::default_settings_path;
use protonvpn::user_config::{DnsStatus, KillswitchMode, NetshieldLevel, SplitTunnelingStatus};
use protonvpn::{Error, Protocol, Result, ServerIntent, Settings, VpnContext};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "protonvpn")]
#[command(about = "ProtonVPN command-line client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: ~/.config/protonvpn/protonvpn.toml)
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the session in the system keychain
    Login {
        /// ProtonVPN account username
        username: String,
    },
    /// Log out and remove stored credentials and cached servers
    Logout,
    /// Connect to a server
    Connect {
        #[command(flatten)]
        target: Target,

        /// Protocol to use (udp, tcp, ikev2, wireguard)
        #[arg(short, long)]
        protocol: Option<String>,
    },
    /// Disconnect the active connection
    Disconnect,
    /// Show connection status
    Status,
    /// List servers available to this account
    Servers {
        /// Only show servers exiting in this country
        #[arg(long, value_name = "CODE")]
        cc: Option<String>,
    },
    /// Show or change user configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Write default settings and user configuration
    Init,
}

#[derive(Args)]
#[group(multiple = false)]
struct Target {
    /// Server name, e.g. CH#4
    servername: Option<String>,

    /// Fastest server (default)
    #[arg(short, long)]
    fastest: bool,

    /// Fastest server in a country
    #[arg(long, value_name = "CODE")]
    cc: Option<String>,

    /// Fastest Secure Core server
    #[arg(long)]
    sc: bool,

    /// Fastest Tor server
    #[arg(long)]
    tor: bool,

    /// Fastest P2P server
    #[arg(long)]
    p2p: bool,

    /// Fastest streaming server
    #[arg(long)]
    stream: bool,

    /// Fastest IPv6 server
    #[arg(long)]
    ipv6: bool,

    /// Random server
    #[arg(short, long)]
    random: bool,
}

impl Target {
    fn intent(&self) -> ServerIntent {
        if let Some(name) = &self.servername {
            return ServerIntent::Name(name.clone());
        }
        if let Some(cc) = &self.cc {
            return ServerIntent::FastestInCountry(cc.clone());
        }
        let features = [
            (self.sc, Feature::SecureCore),
            (self.tor, Feature::Tor),
            (self.p2p, Feature::P2p),
            (self.stream, Feature::Streaming),
            (self.ipv6, Feature::Ipv6),
        ];
        if let Some((_, feature)) = features.into_iter().find(|(set, _)| *set) {
            return ServerIntent::Feature(feature);
        }
        if self.random {
            ServerIntent::Random
        } else {
            ServerIntent::Fastest
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Restore defaults
    Reset,
    /// Change one setting
    Set {
        #[command(subcommand)]
        setting: ConfigSetting,
    },
}

#[derive(Subcommand)]
enum ConfigSetting {
    /// Default protocol (udp, tcp, ikev2, wireguard)
    Protocol { value: String },
    /// Kill switch (disabled, soft, hard)
    Killswitch { value: String },
    /// NetShield (disabled, malware, ads_malware)
    Netshield { value: String },
    /// DNS (enabled, disabled, custom) and up to three custom servers
    Dns { status: String, servers: Vec<String> },
    /// Split tunneling (enabled, disabled) and the excluded addresses
    SplitTunnel { status: String, ips: Vec<String> },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to install log subscriber");
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        if let Some(hint) = hint(&e) {
            eprintln!("{}", hint);
        }
        std::process::exit(exit_code(&e));
    }
}

fn hint(e: &Error) -> Option<&'static str> {
    match e {
        Error::StoredSessionNotFound { .. } => Some("Not logged in. Run: protonvpn login USERNAME"),
        Error::Api5002(_) | Error::Api5003(_) => Some("This client version is no longer supported; please update."),
        Error::VirtualDeviceNotFound | Error::IllegalVirtualDevice(_) => {
            Some("Set paths.openvpn_template in the settings file to a ProtonVPN OpenVPN template.")
        }
        _ => None,
    }
}

fn exit_code(e: &Error) -> i32 {
    match e {
        Error::StoredSessionNotFound { .. } | Error::Keyring(_) => 2,
        Error::Api { .. }
        | Error::UnhandledApi(_)
        | Error::Api403(_)
        | Error::Api5002(_)
        | Error::Api5003(_)
        | Error::ApiTimeout
        | Error::Http(_) => 3,
        Error::IllegalServername(_) | Error::ServerNotFound(_) | Error::EmptyServerList(_) => 4,
        Error::ConnectionNotFound => 5,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);

    if let Commands::Init = cli.command {
        return init(&settings_path);
    }

    let settings = Settings::load_or_default(&settings_path)?;
    let context = VpnContext::from_env(settings)?;

    match cli.command {
        Commands::Init => init(&settings_path)?,
        Commands::Login { username } => {
            let password = rpassword::prompt_password(format!("Password for {}: ", username))?;
            let credentials = context.login(&username, &password).await?;
            println!("Logged in as {} (tier {})", username, credentials.max_tier);
        }
        Commands::Logout => {
            context.logout().await?;
            println!("Logged out");
        }
        Commands::Connect { target, protocol } => {
            let protocol = protocol.as_deref().map(str::parse::<Protocol>).transpose()?;
            let outcome = context.connect(target.intent(), protocol).await?;
            println!(
                "Connected to {} via {} ({})",
                outcome.profile.servername, outcome.profile.protocol, outcome.profile.exit_ip
            );
            println!("Server list: {}", outcome.cache_status);
        }
        Commands::Disconnect => {
            let meta = context.disconnect()?;
            println!("Disconnected from {}", meta.connected_server.as_deref().unwrap_or("server"));
        }
        Commands::Status => {
            let status = context.status()?;
            println!("Status: {}", status.state);
            if let Some(meta) = &status.connection {
                print_connection(meta);
            } else if let Some(last) = &status.last_connection {
                println!("Last connection:");
                print_connection(last);
            }
        }
        Commands::Servers { cc } => {
            let servers = context.servers().await?;
            let tier = context.vpn_credentials()?.max_tier;
            print_servers(&servers, tier, cc.as_deref());
        }
        Commands::Config { action } => config(&context, action)?,
    }

    Ok(())
}

/// Write default settings and user configuration
fn init(settings_path: &Path) -> Result<()> {
    let settings = Settings::default();
    settings.save(settings_path)?;
    println!("Wrote {}", settings_path.display());

    let context = VpnContext::from_env(settings)?;
    context.user_config().reset_default_configs()?;
    println!("Wrote {}", context.user_config().path().display());
    Ok(())
}

fn config(context: &VpnContext, action: ConfigAction) -> Result<()> {
    let manager = context.user_config();
    match action {
        ConfigAction::Show => {
            let config = context.load_user_config()?;
            println!("Protocol:        {}", config.default_protocol);
            println!("Kill switch:     {}", config.killswitch);
            println!("NetShield:       {}", config.netshield);
            println!("DNS:             {}", config.dns.status);
            if !config.dns.custom_dns.is_empty() {
                println!("Custom DNS:      {}", config.dns.custom_dns.join(", "));
            }
            println!("Split tunneling: {}", config.split_tunneling.status);
            if !config.split_tunneling.ip_list.is_empty() {
                println!("Excluded IPs:    {}", config.split_tunneling.ip_list.join(", "));
            }
        }
        ConfigAction::Reset => {
            manager.reset_default_configs()?;
            println!("Configuration reset to defaults");
        }
        ConfigAction::Set { setting } => {
            match setting {
                ConfigSetting::Protocol { value } => manager.update_default_protocol(value.parse()?)?,
                ConfigSetting::Killswitch { value } => manager.update_killswitch(value.parse::<KillswitchMode>()?)?,
                ConfigSetting::Netshield { value } => manager.update_netshield(value.parse::<NetshieldLevel>()?)?,
                ConfigSetting::Dns { status, servers } => {
                    manager.update_dns(status.parse::<DnsStatus>()?, servers)?
                }
                ConfigSetting::SplitTunnel { status, ips } => {
                    manager.update_split_tunneling(status.parse::<SplitTunnelingStatus>()?, ips)?
                }
            }
            println!("Configuration updated");
        }
    }
    Ok(())
}

fn print_connection(meta: &ConnectionMetadata) {
    if let Some(server) = &meta.connected_server {
        println!("Server:   {}", server);
    }
    if let Some(protocol) = &meta.connected_protocol {
        println!("Protocol: {}", protocol);
    }
    if let Some(ip) = &meta.display_server_ip {
        println!("Exit IP:  {}", ip);
    }
    if let Some(since) = meta.connected_time {
        let elapsed = protonvpn::servers::cache::now_secs().saturating_sub(since);
        println!(
            "Uptime:   {}h {}m {}s",
            elapsed / 3600,
            (elapsed % 3600) / 60,
            elapsed % 60
        );
    }
}

fn print_servers(servers: &[LogicalServer], tier: u8, cc: Option<&str>) {
    let cc = cc.map(|c| c.to_uppercase());
    let mut by_country: BTreeMap<String, Vec<&LogicalServer>> = BTreeMap::new();
    for server in servers.iter().filter(|s| s.is_permitted(tier)) {
        if cc.as_deref().is_some_and(|c| c != server.exit_country) {
            continue;
        }
        by_country
            .entry(extract_country_name(&server.exit_country))
            .or_default()
            .push(server);
    }

    for (country, mut servers) in by_country {
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        println!("{}", country);
        for server in servers {
            let features: Vec<&str> = server.feature_list().iter().map(|f| f.as_str()).collect();
            println!(
                "  {:<20} load {:>3}%  tier {}  {}",
                server.name,
                server.load,
                server.tier,
                features.join(",")
            );
        }
    }
}
