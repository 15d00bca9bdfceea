// meshsync: command-line front end
//
// Runs seed nodes that others bootstrap from, manages the JSON config, and
// has a loopback self-test.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use meshsync_core::{identity, MeshConfig, MeshEvent, MeshSocket, SyncSocket, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshsync")]
#[command(about = "MeshSync: gossip mesh with a synchronized map", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: <config dir>/meshsync/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a seed node and run until interrupted
    Seed(SeedArgs),
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run self-tests over loopback
    Test,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Tcp,
    Ssl,
}

#[derive(clap::Args)]
struct SeedArgs {
    /// Address to listen on
    #[arg(short, long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, value_enum, ignore_case = true, default_value = "tcp")]
    transport: Transport,

    /// Address advertised to peers
    #[arg(long, alias = "outward_address")]
    outward_address: Option<String>,

    /// Port advertised to peers
    #[arg(long, alias = "outward_port")]
    outward_port: Option<u16>,

    /// Nodes to dial on startup, as host:port
    #[arg(short, long)]
    connect: Vec<String>,

    /// Carry the synchronized map
    #[arg(long)]
    sync: bool,

    /// With --sync, let any node overwrite any key
    #[arg(long, requires = "sync")]
    no_leasing: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Seed(args) => cmd_seed(cli.config, args).await,
        Commands::Config { action } => cmd_config(cli.config, action),
        Commands::Test => cmd_test().await,
    }
}

enum Node {
    Mesh(MeshSocket),
    Sync(SyncSocket),
}

impl Node {
    fn mesh(&self) -> &MeshSocket {
        match self {
            Node::Mesh(mesh) => mesh,
            Node::Sync(sync) => sync.mesh(),
        }
    }
}

async fn cmd_seed(config_path: Option<PathBuf>, args: SeedArgs) -> Result<()> {
    if args.transport == Transport::Ssl {
        anyhow::bail!("SSL transport is not supported; use --transport tcp");
    }

    let mut config = config::load(config_path.as_deref())?;
    if let Some(address) = args.address {
        config.bind_addr = address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.outward_address.is_some() || args.outward_port.is_some() {
        let host = match args.outward_address {
            Some(host) => host,
            None => identity::lan_ip().await.to_string(),
        };
        config.out_addr = Some((host, args.outward_port.unwrap_or(config.port)));
    }

    let bind_target = format!("{}:{}", config.bind_addr, config.port);
    let node = if args.sync {
        let sync = SyncSocket::bind(config, !args.no_leasing)
            .await
            .with_context(|| format!("Failed to bind {}", bind_target))?;
        Node::Sync(sync)
    } else {
        let mesh = MeshSocket::bind(config)
            .await
            .with_context(|| format!("Failed to bind {}", bind_target))?;
        Node::Mesh(mesh)
    };
    let mesh = node.mesh();

    println!("{}", "MeshSync seed node".bold());
    println!();
    println!("Node ID:   {}", mesh.id().bright_cyan());
    println!("Listening: {}", mesh.local_addr());
    println!("Outward:   {}:{}", mesh.out_addr().0, mesh.out_addr().1);
    println!("Protocol:  {} ({})", mesh.protocol().subnet, mesh.protocol().id());
    println!();

    for target in &args.connect {
        let (host, port) = target
            .rsplit_once(':')
            .with_context(|| format!("Expected host:port, got {}", target))?;
        let port: u16 = port.parse().context("Invalid port number")?;
        match mesh.connect(host, port).await {
            Ok(_) => println!("{} Dialed {}", "✓".green(), target),
            Err(e) => println!("{} Could not dial {}: {}", "✗".red(), target, e),
        }
    }

    let mut events = mesh.subscribe();
    println!("{}", "Running. Press Ctrl-C to stop.".dimmed());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(MeshEvent::Connect) => println!("{} Joined the mesh", "✓".green()),
                Some(MeshEvent::Disconnect { peer_id }) => {
                    println!("{} Peer left: {}", "←".bright_blue(), peer_id)
                }
                Some(MeshEvent::Message(msg)) => {
                    println!("{} {}: {:?}", "←".bright_blue(), msg.sender().bright_cyan(), msg.payload());
                    // Seeds only relay; keep the queue from growing
                    let _ = mesh.recv_many(usize::MAX);
                }
                Some(MeshEvent::Update { key, owner, .. }) => {
                    println!("{} {} set by {}", "✎".yellow(), String::from_utf8_lossy(&key), owner)
                }
                Some(MeshEvent::Delete { key }) => {
                    println!("{} {} deleted", "✎".yellow(), String::from_utf8_lossy(&key))
                }
                None => break,
            }
        }
    }

    println!();
    println!("Shutting down ({} peers)", mesh.peer_count());
    for error in mesh.status() {
        println!("  {} {}", "!".bright_red(), error);
    }
    mesh.close();
    tracing::info!("Seed node {} stopped", mesh.id());
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    let path = match config_path {
        Some(path) => path,
        None => config::config_file()?,
    };
    let mut mesh_config = if path.exists() {
        config::load_from(&path)?
    } else {
        MeshConfig::default()
    };

    match action {
        ConfigAction::Set { key, value } => {
            config::set(&mut mesh_config, &key, &value)?;
            config::save_to(&mesh_config, &path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config::get(&mesh_config, &key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config::list(&mesh_config) {
                println!("  {:<14} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => println!("{}", path.display()),
    }

    Ok(())
}

async fn cmd_test() -> Result<()> {
    println!("{}", "Running self-tests...".bold());
    println!();

    let alice = SyncSocket::bind(MeshConfig::local(0), true).await?;
    let bob = SyncSocket::bind(MeshConfig::local(0), true).await?;
    println!("{} Nodes bound", "✓".green());

    bob.connect("127.0.0.1", alice.local_addr().port()).await?;
    wait_for(|| alice.peer_count() == 1 && bob.peer_count() == 1)
        .await
        .context("Handshake did not complete")?;
    println!("{} Handshake", "✓".green());

    alice.send(vec![Value::from("ping")])?;
    wait_for(|| bob.recv().is_some())
        .await
        .context("Broadcast was not delivered")?;
    println!("{} Broadcast", "✓".green());

    alice.set("key", "value")?;
    wait_for(|| bob.get(b"key").is_some())
        .await
        .context("Store did not propagate")?;
    println!("{} Synchronized store", "✓".green());

    if bob.set("key", "other").is_ok() {
        anyhow::bail!("Lease was not enforced");
    }
    println!("{} Leasing", "✓".green());

    println!();
    println!("{}", "All tests passed".green().bold());
    Ok(())
}

async fn wait_for<F: FnMut() -> bool>(mut cond: F) -> Result<()> {
    for _ in 0..100 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("timed out")
}
