#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use xpcsentry_lib::codesign::CodeIdentityResolver;
use xpcsentry_lib::config::{Config, ConfigLoader, OutputFormat};
use xpcsentry_lib::detection::DetectionPolicy;
use xpcsentry_lib::launchd::Resolver;
use xpcsentry_lib::models::{CodeIdentity, Domain, Service, VerdictReason};
use xpcsentry_lib::telemetry::{self, PerformanceTimer};

/// xpcsentry command-line interface
#[derive(Parser)]
#[command(name = "xpcsentry-cli")]
#[command(about = "Look up XPC endpoint owners and code identities")]
#[command(version)]
struct Cli {
    /// Output format (human or json)
    #[arg(short, long, value_name = "FORMAT", global = true)]
    format: Option<String>,

    /// Log level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file merged above the system and user files
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the program that owns an endpoint
    Resolve {
        endpoint: String,
        /// Search only this domain, e.g. gui/501 (default: system, user and gui of --uid)
        #[arg(short, long, value_name = "SPEC")]
        domain: Option<Domain>,
        /// User whose domains are searched (default: current user)
        #[arg(short, long)]
        uid: Option<u32>,
    },
    /// List the services of a domain
    Services {
        #[arg(short, long, value_name = "SPEC")]
        domain: Domain,
    },
    /// Print the supervisor's raw dump of a domain or service
    Print {
        #[arg(short, long, value_name = "SPEC")]
        domain: Domain,
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Print the code identity of a program
    Identity { path: String },
    /// Check a requesting program against an endpoint's owner
    Check {
        endpoint: String,
        /// Program that connects to the endpoint
        #[arg(short, long, value_name = "PATH")]
        requester: String,
        #[arg(short, long, value_name = "SPEC")]
        domain: Option<Domain>,
        #[arg(short, long)]
        uid: Option<u32>,
    },
}

#[derive(Serialize)]
struct Resolution<'a> {
    endpoint: &'a str,
    domain: Option<Domain>,
    program_path: String,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    endpoint: &'a str,
    domain: Option<Domain>,
    owner: CodeIdentity,
    requester: CodeIdentity,
    suspicious: bool,
    reason: VerdictReason,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new("xpcsentry-cli");
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load()?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    ConfigLoader::validate_config(&config)?;
    let format = match &cli.format {
        Some(format) => format.parse::<OutputFormat>()?,
        None => config.agent.output_format,
    };

    telemetry::init_tracing(&config.logging)?;

    let timer = PerformanceTimer::start("cli_command");
    execute(cli.command, &config, format)?;
    debug!(elapsed = ?timer.finish(), "Command finished");
    Ok(())
}

fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

fn execute(command: Command, config: &Config, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Resolve { endpoint, domain, uid } => {
            let resolver = Resolver::from_config(&config.launchd);
            let program_path = match domain {
                Some(domain) => resolver.resolve(&endpoint, domain),
                None => resolver.resolve_endpoint(&endpoint, uid.unwrap_or_else(current_uid)),
            };
            debug!(stats = ?resolver.stats(), "Resolver statistics");

            let resolution = Resolution {
                endpoint: &endpoint,
                domain,
                program_path,
            };
            match format {
                OutputFormat::Json => emit(&serde_json::to_string_pretty(&resolution)?),
                OutputFormat::Human => emit(&resolution.program_path),
            }
        }
        Command::Services { domain } => {
            let resolver = Resolver::from_config(&config.launchd);
            let services = resolver
                .domain_services(domain)
                .ok_or_else(|| format!("no answer from the supervisor for {domain}"))?;
            match format {
                OutputFormat::Json => emit(&serde_json::to_string_pretty(&services)?),
                OutputFormat::Human => emit(&render_services(&services)),
            }
        }
        Command::Print { domain, service } => {
            let resolver = Resolver::from_config(&config.launchd);
            let dump = resolver.print(domain, service.as_deref())?;
            match format {
                OutputFormat::Json => emit(&serde_json::to_string_pretty(&serde_json::json!({
                    "domain": domain,
                    "service": service,
                    "dump": dump,
                }))?),
                OutputFormat::Human => emit(dump.trim_end()),
            }
        }
        Command::Identity { path } => {
            let identity = CodeIdentityResolver::from_config(&config.codesign).identify(&path);
            match format {
                OutputFormat::Json => emit(&serde_json::to_string_pretty(&identity)?),
                OutputFormat::Human => emit(&render_identity(&identity)),
            }
        }
        Command::Check {
            endpoint,
            requester,
            domain,
            uid,
        } => {
            let resolver = Resolver::from_config(&config.launchd);
            let program = match domain {
                Some(domain) => resolver.resolve(&endpoint, domain),
                None => resolver.resolve_endpoint(&endpoint, uid.unwrap_or_else(current_uid)),
            };
            let identities = CodeIdentityResolver::from_config(&config.codesign);
            let owner = identities.identify(&program);
            let requester = identities.identify(&requester);
            let verdict = DetectionPolicy::from(&config.detection).classify(&owner, &requester);

            let report = CheckReport {
                endpoint: &endpoint,
                domain,
                owner,
                requester,
                suspicious: verdict.suspicious,
                reason: verdict.reason,
            };
            match format {
                OutputFormat::Json => emit(&serde_json::to_string_pretty(&report)?),
                OutputFormat::Human => emit(&render_check(&report)),
            }
        }
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn emit(text: &str) {
    println!("{text}");
}

fn render_services(services: &[Service]) -> String {
    services
        .iter()
        .map(|service| match service.handle {
            Some(handle) => format!("{handle}\t{}", service.name),
            None => format!("-\t{}", service.name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_identity(identity: &CodeIdentity) -> String {
    format!(
        "path: {}\nsigning_id: {}\nteam_id: {}",
        identity.path, identity.signing_id, identity.team_id
    )
}

fn render_check(report: &CheckReport<'_>) -> String {
    format!(
        "endpoint: {}\nowner: \"{}\" (team: {}, signing_id: {})\nrequester: \"{}\" (team: {}, signing_id: {})\nverdict: {} ({})",
        report.endpoint,
        report.owner.path,
        report.owner.team_id,
        report.owner.signing_id,
        report.requester.path,
        report.requester.team_id,
        report.requester.signing_id,
        if report.suspicious { "suspicious" } else { "ok" },
        report.reason,
    )
}
