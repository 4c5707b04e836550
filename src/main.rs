use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mcp_stdio::mcp_client::{ClientConfig, McpClient, ServerConfig, ServerEvent};
use mcp_stdio::{init_tracing, LogFormat, LogTarget};

#[derive(Parser)]
#[command(name = "mcp-probe")]
#[command(about = "Start an MCP stdio server, list its tools and optionally call one")]
struct Args {
    /// Client config file (JSON, or YAML by extension)
    #[arg(long, conflicts_with_all = ["module", "command"])]
    config: Option<PathBuf>,

    /// Python module to run as `python3 -m <module>`
    #[arg(long, conflicts_with = "command")]
    module: Option<String>,

    /// Server name used in logs
    #[arg(long, default_value = "server")]
    name: String,

    /// Tool to call after listing
    #[arg(long)]
    call: Option<String>,

    /// JSON arguments for --call
    #[arg(long, default_value = "{}", requires = "call")]
    args: String,

    /// Fail a call that is not answered within this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print server events for this many seconds before stopping
    #[arg(long)]
    watch: Option<u64>,

    /// Write logs to this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Server command and arguments
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = if let Some(path) = &self.config {
            ClientConfig::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?
        } else if let Some(module) = &self.module {
            ClientConfig::new(&self.name, ServerConfig::python_module(module))
        } else if let Some((program, rest)) = self.command.split_first() {
            let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
            ClientConfig::new(&self.name, ServerConfig::new(program, &rest))
        } else {
            bail!("no server given: pass --config, --module or a command");
        };

        if self.timeout_ms.is_some() {
            config.call_timeout_ms = self.timeout_ms;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let target = match &args.log_dir {
        Some(dir) => LogTarget::Dir(dir.clone()),
        None => LogTarget::Stderr,
    };
    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(target, format).context("Failed to initialize logging")?;

    let config = args.client_config()?;
    let client = McpClient::new(config);
    let mut events = client.subscribe();

    client
        .start()
        .await
        .with_context(|| format!("Failed to start server '{}'", client.name()))?;

    let outcome = probe(&client, &args, &mut events).await;

    client.stop().await.context("Failed to stop server")?;
    outcome
}

async fn probe(
    client: &McpClient,
    args: &Args,
    events: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
) -> Result<()> {
    let tools = client.list_tools();
    println!("{}", serde_json::to_string_pretty(&*tools)?);

    if let Some(tool) = &args.call {
        let arguments: serde_json::Value = serde_json::from_str(&args.args)
            .with_context(|| format!("--args is not valid JSON: {}", args.args))?;
        let result = client
            .call_tool(tool, arguments)
            .await
            .with_context(|| format!("Tool call '{tool}' failed"))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if let Some(secs) = args.watch {
        let deadline = tokio::time::sleep(Duration::from_secs(secs));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(event) => println!("{event:?}"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    Ok(())
}
