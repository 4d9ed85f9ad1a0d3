use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fleet_lite::agent::{AgentClient, AgentServer};
use fleet_lite::config::{
    default_config_dir, AgentConfig, ChunkOverflow, FallbackPolicy, OrchestratorConfig, SshConfig,
    TlsConfig, DEFAULT_AGENT_PORT,
};
use fleet_lite::fleet::{CreateFleetRequest, Fleet, LocalHost, LocalSshProvider, Provider};
use fleet_lite::orchestrator::{
    AgentChannel, FleetReport, NodeChannel, Orchestrator, RunOptions, SshChannel,
};
use fleet_lite::scheduler::TaskSpec;
use fleet_lite::shutdown::install_shutdown_handler;
use fleet_lite::telemetry::{SharedSink, TracingSink};
use fleet_lite::tls::ClientTls;
use fleet_lite::transfer::{TransferJob, TransferManager};
use fleet_lite::transport::keys::{generate_keypair, parse_authorized_key};
use fleet_lite::transport::{fetch_host_key, KnownHosts, SecureTransport, SshConnector, SshTarget};

#[derive(Parser, Debug)]
#[command(name = "fleet-lite")]
#[command(version)]
#[command(about = "Run tasks across ephemeral fleets over a node agent or SSH")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the node agent
    Agent(AgentArgs),

    /// Generate the ed25519 key used to authenticate to nodes
    Keygen {
        /// Private key path (default: <config dir>/ssh/id_ed25519)
        #[arg(long)]
        key: Option<PathBuf>,

        #[arg(long, default_value = "fleet-lite")]
        comment: String,
    },

    /// Record a host's public key in the trust store
    TrustHost {
        host: String,

        #[arg(long, default_value = "22")]
        port: u16,

        /// Public key as "<type> <base64>". Fetched from the host when omitted.
        #[arg(long)]
        public_key: Option<String>,

        #[command(flatten)]
        ssh: SshArgs,
    },

    /// Check every node's agent heartbeat
    Ping {
        #[command(flatten)]
        fleet: FleetArgs,

        #[command(flatten)]
        agent: AgentClientArgs,

        /// Keep polling each node for up to this many seconds
        #[arg(long, default_value = "0")]
        wait: u64,
    },

    /// Run a task module across the fleet
    Run(RunArgs),

    /// Upload files to every node, verified by SHA-256
    Push {
        #[command(flatten)]
        fleet: FleetArgs,

        #[command(flatten)]
        ssh: SshArgs,

        /// Transfers as LOCAL:REMOTE
        #[arg(required = true)]
        files: Vec<String>,
    },
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8088")]
    listen: SocketAddr,

    /// Shared bearer token required on exec requests
    #[arg(long, env = "FLEET_AGENT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Cap on captured bytes per output stream
    #[arg(long, default_value = "4194304")]
    max_output_bytes: usize,

    /// Largest accepted exec request body in bytes, chunk input included
    #[arg(long, default_value = "67108864")]
    max_request_bytes: usize,

    // === TLS Options ===
    /// Path to the agent certificate (PEM format)
    #[arg(long, env = "FLEET_AGENT_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// Path to the agent private key (PEM format)
    #[arg(long, env = "FLEET_AGENT_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// CA used to verify client certificates (PEM format)
    #[arg(long, env = "FLEET_AGENT_CLIENT_CA")]
    client_ca: Option<PathBuf>,

    /// Require a client certificate signed by --client-ca
    #[arg(long, env = "FLEET_AGENT_REQUIRE_MTLS")]
    require_mtls: bool,

    /// Serve plaintext when TLS material is incomplete.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct FleetArgs {
    /// YAML file listing the fleet's hosts
    #[arg(long, short = 'H')]
    hosts: PathBuf,
}

#[derive(Parser, Debug)]
struct SshArgs {
    /// Private key (default: <config dir>/ssh/id_ed25519)
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Trust store (default: <config dir>/ssh/known_hosts)
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// SSH connect timeout in seconds
    #[arg(long, default_value = "30")]
    connect_timeout: u64,
}

#[derive(Parser, Debug)]
struct AgentClientArgs {
    #[arg(long, default_value_t = DEFAULT_AGENT_PORT)]
    agent_port: u16,

    #[arg(long, env = "FLEET_AGENT_TOKEN", hide_env_values = true)]
    agent_token: Option<String>,

    /// CA that signed the agents' certificates; switches to https
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate for mTLS (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key for mTLS (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Task module (YAML)
    task: PathBuf,

    #[command(flatten)]
    fleet: FleetArgs,

    #[command(flatten)]
    agent: AgentClientArgs,

    #[command(flatten)]
    ssh: SshArgs,

    /// Input files, replacing the task's own
    #[arg(long, short = 'i')]
    input: Vec<PathBuf>,

    /// Extra environment as KEY=VALUE; wins over the task's env
    #[arg(long, short = 'e')]
    env: Vec<String>,

    /// Per-node timeout in seconds (0 = none)
    #[arg(long, default_value = "0")]
    timeout: u64,

    /// Max nodes executing at once (default: whole fleet)
    #[arg(long, short = 'c')]
    concurrency: Option<usize>,

    /// Retry over SSH when a node's agent cannot be reached
    #[arg(long)]
    ssh_fallback: bool,

    /// Run surplus chunks on nodes in turn instead of refusing the plan
    #[arg(long)]
    spread: bool,

    /// Files to upload before running, as LOCAL:REMOTE
    #[arg(long)]
    upload: Vec<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Hosts File
// =============================================================================

#[derive(Debug, Deserialize)]
struct HostsFile {
    #[serde(default = "default_fleet_name")]
    fleet: String,
    hosts: Vec<LocalHost>,
}

fn default_fleet_name() -> String {
    "local".to_string()
}

struct PingOutput {
    node: String,
    ok: bool,
    version: Option<String>,
    error: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn load_fleet(path: &Path) -> Result<Fleet, Box<dyn std::error::Error>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read hosts file {}: {}", path.display(), e))?;
    let file: HostsFile = serde_yaml::from_str(&text)?;
    let count = file.hosts.len();
    let provider = LocalSshProvider::new(file.hosts);
    let fleet = provider
        .create_fleet(&CreateFleetRequest::new(file.fleet, count))
        .await?;
    Ok(fleet)
}

fn ssh_config(args: &SshArgs) -> SshConfig {
    let mut config = SshConfig::default();
    if let Some(key) = &args.ssh_key {
        config = config.with_key_path(key);
    }
    if let Some(known_hosts) = &args.known_hosts {
        config = config.with_known_hosts(known_hosts);
    }
    config.connect_timeout = Duration::from_secs(args.connect_timeout);
    config
}

async fn secure_transport(args: &SshArgs) -> Result<SecureTransport, Box<dyn std::error::Error>> {
    let config = ssh_config(args);
    let connector = SshConnector::from_config(&config).await?;
    Ok(SecureTransport::new(Arc::new(connector), config))
}

async fn agent_client(
    args: &AgentClientArgs,
    config: &mut OrchestratorConfig,
) -> Result<AgentClient, Box<dyn std::error::Error>> {
    config.agent_port = args.agent_port;
    config.agent_token = args.agent_token.clone();

    let tls = if args.ca_cert.is_some() || args.cert.is_some() {
        config.agent_scheme = "https".to_string();
        let tls = ClientTls::load(
            args.ca_cert.as_deref(),
            args.cert.as_deref(),
            args.key.as_deref(),
        )
        .await?;
        Some(tls)
    } else {
        None
    };
    Ok(AgentClient::new(config, tls.as_ref())?)
}

fn parse_transfers(specs: &[String]) -> Result<Vec<TransferJob>, Box<dyn std::error::Error>> {
    specs
        .iter()
        .map(|spec| -> Result<TransferJob, Box<dyn std::error::Error>> {
            match spec.split_once(':') {
                Some((local, remote)) if !local.is_empty() && remote.starts_with('/') => {
                    Ok(TransferJob::new(local, remote))
                }
                _ => Err(format!("invalid transfer {:?}, expected LOCAL:/remote/path", spec).into()),
            }
        })
        .collect()
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>, Box<dyn std::error::Error>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                env.insert(k.to_string(), v.to_string());
            }
            _ => return Err(format!("invalid env {:?}, expected KEY=VALUE", pair).into()),
        }
    }
    Ok(env)
}

fn telemetry() -> SharedSink {
    Arc::new(TracingSink)
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_agent(
    args: AgentArgs,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let tls = TlsConfig {
        enabled: args.tls_cert.is_some() || args.tls_key.is_some() || args.require_mtls,
        ca_cert_path: args.client_ca,
        cert_path: args.tls_cert,
        key_path: args.tls_key,
        require_client_cert: args.require_mtls,
        allow_insecure: args.allow_insecure,
    };
    let mut config = AgentConfig {
        listen_addr: args.listen,
        tls,
        max_output_bytes: args.max_output_bytes,
        max_request_bytes: args.max_request_bytes,
        ..AgentConfig::default()
    };
    if let Some(token) = args.token.filter(|t| !t.is_empty()) {
        config = config.with_token(token);
    } else {
        tracing::warn!("No agent token configured; exec requests are not authenticated");
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        tls_enabled = config.tls.enabled,
        mtls = config.tls.require_client_cert,
        version = %config.version,
        "Starting fleet-lite agent"
    );

    let telemetry = telemetry();
    AgentServer::new(config, telemetry.clone()).run(cancel).await?;
    telemetry.shutdown();
    Ok(())
}

async fn handle_keygen(
    key: Option<PathBuf>,
    comment: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = key.unwrap_or_else(|| SshConfig::default().key_path);
    let public = generate_keypair(&path, comment).await?;
    println!("Private key: {}", path.display());
    println!("Public key:  {}", public);
    Ok(())
}

async fn handle_trust_host(
    host: &str,
    port: u16,
    public_key: Option<String>,
    ssh: &SshArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ssh_config(ssh);
    let (key_type, key) = match public_key {
        Some(line) => parse_authorized_key(&line)?,
        None => {
            let target = SshTarget::new(host, port, config.default_user.clone());
            fetch_host_key(&target, config.connect_timeout).await?
        }
    };

    let store = KnownHosts::open(&config.known_hosts_path).await?;
    if store.trust(host, port, &key_type, &key).await? {
        println!("Trusted {} ({})", host, key_type);
    } else {
        println!("{} is already trusted with this key", host);
    }
    Ok(())
}

async fn handle_ping(
    fleet_args: &FleetArgs,
    agent_args: &AgentClientArgs,
    wait: u64,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let fleet = load_fleet(&fleet_args.hosts).await?;
    let mut config = OrchestratorConfig::default();
    let client = agent_client(agent_args, &mut config).await?;

    let mut outputs = Vec::with_capacity(fleet.len());
    for node in &fleet.nodes {
        let result = if wait > 0 {
            client
                .wait_ready(node, Duration::from_secs(wait), Duration::from_secs(2), cancel)
                .await
        } else {
            client.heartbeat(node, cancel).await
        };
        outputs.push(match result {
            Ok(hb) => PingOutput {
                node: node.name.clone(),
                ok: true,
                version: Some(hb.version),
                error: None,
            },
            Err(e) => PingOutput {
                node: node.name.clone(),
                ok: false,
                version: None,
                error: Some(e.to_string()),
            },
        });
    }

    println!("{:<20} {:<8} DETAIL", "NODE", "STATUS");
    println!("{}", "-".repeat(50));
    for out in &outputs {
        let (status, detail) = if out.ok {
            ("[+] up", out.version.clone().unwrap_or_default())
        } else {
            ("[-] down", out.error.clone().unwrap_or_default())
        };
        println!("{:<20} {:<8} {}", out.node, status, detail);
    }
    if outputs.iter().any(|o| !o.ok) {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_push(
    fleet_args: &FleetArgs,
    ssh: &SshArgs,
    files: &[String],
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = parse_transfers(files)?;
    let fleet = load_fleet(&fleet_args.hosts).await?;
    let manager = TransferManager::new(secure_transport(ssh).await?, telemetry());

    let report = manager.upload_to_fleet(&fleet, &jobs, cancel).await?;
    for node in &report.nodes {
        match &node.result {
            Ok(delivered) => println!("[+] {:<20} {} file(s)", node.node, delivered.len()),
            Err(e) => println!("[-] {:<20} {}", node.node, e),
        }
    }
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_run(
    args: RunArgs,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let task = TaskSpec::load(&args.task).await?;
    let fleet = load_fleet(&args.fleet.hosts).await?;
    let env = parse_env(&args.env)?;
    let uploads = parse_transfers(&args.upload)?;

    let mut config = OrchestratorConfig {
        concurrency: args.concurrency,
        fallback: if args.ssh_fallback {
            FallbackPolicy::Automatic
        } else {
            FallbackPolicy::Disabled
        },
        overflow: if args.spread {
            ChunkOverflow::Spread
        } else {
            ChunkOverflow::Reject
        },
        ..OrchestratorConfig::default()
    };
    let client = agent_client(&args.agent, &mut config).await?;
    let telemetry = telemetry();

    let transport = if args.ssh_fallback || !uploads.is_empty() {
        Some(secure_transport(&args.ssh).await?)
    } else {
        None
    };

    if let Some(transport) = transport.as_ref().filter(|_| !uploads.is_empty()) {
        let manager = TransferManager::new(transport.clone(), telemetry.clone());
        let report = manager.upload_to_fleet(&fleet, &uploads, cancel).await?;
        if !report.is_success() {
            for (node, err) in report.failures() {
                eprintln!("Upload to {} failed: {}", node, err);
            }
            return Err("upload failed; task not started".into());
        }
    }

    let ssh: Option<Arc<dyn NodeChannel>> = match (args.ssh_fallback, transport) {
        (true, Some(transport)) => Some(Arc::new(SshChannel::new(transport))),
        _ => None,
    };
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(AgentChannel::new(client)),
        ssh,
        telemetry.clone(),
    )?;

    let options = RunOptions {
        inputs: args.input,
        env,
        timeout_seconds: args.timeout,
    };
    let report = orchestrator.run(&fleet, &task, options, cancel).await?;
    telemetry.flush();

    print_report(&report, &args.output)?;
    if report.failed() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(
    report: &FleetReport,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            println!("{:<20} {:<6} {:<6} {:<6} DURATION", "NODE", "CHUNK", "VIA", "EXIT");
            println!("{}", "-".repeat(55));
            for r in &report.results {
                let exit = r
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<6} {:<6} {:<6} {:?}",
                    r.node, r.chunk_index, r.channel, exit, r.duration
                );
            }
            for r in report.results.iter().filter(|r| r.success() && !r.stdout.is_empty()) {
                println!();
                println!("== {} (chunk {}) ==", r.node, r.chunk_index);
                print!("{}", r.stdout);
                if !r.stdout.ends_with('\n') {
                    println!();
                }
            }
            println!();
            println!("{}", report.summary_line());
            let failed = report.failed_outputs();
            if !failed.is_empty() {
                println!();
                println!("Failed nodes:");
                for (node, diagnostic) in failed {
                    println!("  {}:", node);
                    for line in diagnostic.lines() {
                        println!("    {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cancel = install_shutdown_handler();
    tracing::debug!(config_dir = %default_config_dir().display(), "Resolved config directory");

    match args.command {
        Commands::Agent(agent_args) => {
            run_agent(agent_args, cancel).await?;
        }
        Commands::Keygen { key, comment } => {
            handle_keygen(key, &comment).await?;
        }
        Commands::TrustHost {
            host,
            port,
            public_key,
            ssh,
        } => {
            handle_trust_host(&host, port, public_key, &ssh).await?;
        }
        Commands::Ping { fleet, agent, wait } => {
            handle_ping(&fleet, &agent, wait, &cancel).await?;
        }
        Commands::Run(run_args) => {
            handle_run(run_args, &cancel).await?;
        }
        Commands::Push { fleet, ssh, files } => {
            handle_push(&fleet, &ssh, &files, &cancel).await?;
        }
    }

    Ok(())
}
