//! node-trust CLI - offline address classification and CSR inspection

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_trust::address::{classify, ObservedAddress, PlatformPolicy};
use node_trust::config::CloudConfig;
use node_trust::csr::KubeletServingRequest;

/// node-trust - node address classification and kubelet serving CSR checks
#[derive(Parser, Debug)]
#[command(name = "node-trust", version, about, long_about = None)]
struct Cli {
    /// Path to the cloud-config YAML file
    #[arg(short = 'c', long = "config", env = "NODE_TRUST_CONFIG", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify observed addresses into node addresses
    ///
    /// Addresses are given as `ip/prefix`, optionally followed by
    /// `@link` naming the interface they were observed on.
    Classify(ClassifyArgs),

    /// Check a CSR object the way the approver would and print its claims
    InspectCsr(InspectCsrArgs),
}

/// Classify mode arguments
#[derive(Parser, Debug)]
struct ClassifyArgs {
    /// Platform the node runs on (e.g. metal, nocloud, gcp)
    #[arg(short, long)]
    platform: String,

    /// IP the kubelet was started with
    #[arg(long)]
    provided_ip: Option<String>,

    /// Order IPv6 external addresses first (overrides the config file)
    #[arg(long)]
    prefer_ipv6: bool,

    /// Observed addresses, `ip/prefix[@link]`
    #[arg(required = true)]
    addresses: Vec<String>,
}

/// Inspect mode arguments
#[derive(Parser, Debug)]
struct InspectCsrArgs {
    /// Path to a CertificateSigningRequest manifest (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    csr_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = cli
        .config_file
        .as_deref()
        .map(CloudConfig::load)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Failed to load cloud config: {}", e))?;

    match cli.command {
        Commands::Classify(args) => run_classify(args, config.as_ref()),
        Commands::InspectCsr(args) => run_inspect_csr(&args.csr_file),
    }
}

fn run_classify(args: ClassifyArgs, config: Option<&CloudConfig>) -> anyhow::Result<()> {
    let prefer_ipv6 = args.prefer_ipv6 || config.is_some_and(|c| c.global.prefer_ipv6);

    let mut policy = PlatformPolicy::new(args.platform).prefer_ipv6(prefer_ipv6);
    if let Some(ip) = args.provided_ip {
        policy = policy.with_provided_ip(ip);
    }

    let observed = args
        .addresses
        .iter()
        .map(String::as_str)
        .map(parse_observed)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let classified = classify(&policy, &observed)?;
    println!("{}", serde_json::to_string_pretty(&classified)?);
    Ok(())
}

fn parse_observed(s: &str) -> anyhow::Result<ObservedAddress> {
    let (address, link) = match s.split_once('@') {
        Some((address, link)) => (address, Some(link)),
        None => (s, None),
    };
    let mut observed = ObservedAddress::parse(address)?;
    observed.link_name = link.filter(|l| !l.is_empty()).map(str::to_string);
    Ok(observed)
}

fn run_inspect_csr(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read CSR file {:?}: {}", path, e))?;

    // YAML is a superset of JSON, so one parser covers both
    let csr: CertificateSigningRequest = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse CertificateSigningRequest: {}", e))?;

    let recognized = KubeletServingRequest::from_csr(&csr)?;
    let claims = serde_json::json!({
        "csr": recognized.csr_name,
        "node": recognized.node_name,
        "dnsNames": recognized.request.dns_names,
        "ipAddresses": recognized
            .request
            .ip_sans
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}
