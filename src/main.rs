use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use toolmux::mcp_client::cache::{DiscoveryCache, JsonFileCache, MemoryCache};
use toolmux::mcp_client::config::{find_config_path, load_servers_config};
use toolmux::mcp_client::{ConnectionPool, ToolHost};
use toolmux::{init_tracing, LogTarget};

#[derive(Parser, Debug)]
#[command(name = "toolmux")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Talk to a fleet of MCP tool servers through one resilient client")]
struct Args {
    /// Server configuration file (defaults to $TOOLMUX_CONFIG, then mcp-servers.{json,yaml} up from cwd)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Do not read or write the discovery cache
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to every configured server and report its status
    Servers,

    /// List known tools
    Tools {
        /// Only this server
        #[arg(short, long)]
        server: Option<String>,

        /// Rediscover live instead of trusting cached metadata
        #[arg(long)]
        refresh: bool,
    },

    /// Call one tool and print its result
    Call {
        server: String,
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let target = if args.verbose {
        LogTarget::Stderr
    } else {
        LogTarget::File
    };
    if let Err(e) = init_tracing(target) {
        eprintln!("warning: could not open log file ({e}), logging to stderr");
        let _ = init_tracing(LogTarget::Stderr);
    }

    let host = build_host(&args)?;
    let outcome = run(&host, args.command).await;
    host.shutdown().await;
    outcome
}

fn build_host(args: &Args) -> Result<ToolHost> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().context("cannot read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let descriptors = load_servers_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let cache: Arc<dyn DiscoveryCache> = if args.no_cache {
        Arc::new(MemoryCache::new())
    } else {
        match JsonFileCache::open_default() {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                tracing::warn!(error = %e, "discovery cache unavailable, using memory only");
                Arc::new(MemoryCache::new())
            }
        }
    };

    Ok(ToolHost::new(descriptors, ConnectionPool::default(), cache))
}

async fn run(host: &ToolHost, command: Command) -> Result<ExitCode> {
    match command {
        Command::Servers => {
            let failures = host.start_all().await;
            for (name, status) in host.status().await {
                let state = if status.connected {
                    "connected"
                } else {
                    "disconnected"
                };
                let info = host
                    .pool()
                    .get_session(&name)
                    .await
                    .and_then(|s| s.server_info().cloned())
                    .map(|i| {
                        format!(
                            " ({} {})",
                            i.name.as_deref().unwrap_or("?"),
                            i.version.as_deref().unwrap_or("?")
                        )
                    })
                    .unwrap_or_default();
                println!("{name}\t{state}{info}");
            }
            for (name, error) in &failures {
                eprintln!("{name}: {error}");
            }
            Ok(if failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Tools { server, refresh } => {
            host.load_cached().await;

            let wanted: Vec<String> = host
                .descriptors()
                .map(|d| d.name.clone())
                .filter(|name| server.as_deref().map_or(true, |s| s == name))
                .collect();
            if let Some(s) = &server {
                if wanted.is_empty() {
                    anyhow::bail!("unknown server '{s}'");
                }
            }

            let known = host.tools().await;
            let mut failed = false;
            for name in &wanted {
                let has_tools = known.iter().any(|t| &t.server == name);
                if refresh || !has_tools {
                    if let Err(e) = host.connect_server(name).await {
                        eprintln!("{name}: {e}");
                        failed = true;
                    }
                }
            }

            for tool in host.tools().await {
                if !wanted.contains(&tool.server) {
                    continue;
                }
                let description = tool.description.as_deref().unwrap_or("");
                println!("{}\t{description}", tool.qualified_name);
            }
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }

        Command::Call { server, tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;

            let result = host.call(&server, &tool, arguments).await?;
            for block in &result.content {
                println!("{}", block.text);
            }
            Ok(if result.is_error {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}
