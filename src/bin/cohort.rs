//! Binary entry point for the `cohort` CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use cohort::{
    config::EngineConfig,
    coordinator::{Coordinator, QueryEvent},
    query::QueryRequest,
    server,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser, Debug)]
#[command(
    name = "cohort",
    version,
    about = "Phase-aware cohort queries over a hierarchical survey store",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    #[arg(
        long,
        global = true,
        env = "COHORT_CONFIG",
        value_name = "FILE",
        help = "Configuration file (defaults to the user config dir)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Serve the store from a JSON fixture"
    )]
    fixture: Option<PathBuf>,

    #[arg(long, global = true, value_name = "URL", help = "Remote store base URL")]
    url: Option<String>,
}

#[derive(Args, Debug)]
struct QueryCmd {
    #[arg(
        value_name = "REQUEST",
        default_value = "-",
        help = "JSON request file, or - for stdin"
    )]
    request: PathBuf,

    #[arg(long, help = "Print every frame as NDJSON instead of the final data")]
    ndjson: bool,

    #[arg(long, help = "Hide the progress spinner")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Serve the HTTP endpoint")]
    Serve {
        #[arg(long, value_name = "ADDR", help = "Listen address override")]
        bind: Option<String>,
    },

    #[command(about = "Run a query and print the matched profiles")]
    Query(QueryCmd),

    #[command(about = "Print the plan chosen for a query")]
    Explain {
        #[arg(value_name = "REQUEST", default_value = "-")]
        request: PathBuf,
    },

    #[command(about = "List the fields known to the schema")]
    Fields,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.store.config.clone())?;
    if let Some(url) = cli.store.url {
        config.store.base_url = Some(url);
        config.store.fixture = None;
    }
    if let Some(fixture) = cli.store.fixture {
        config.store.fixture = Some(fixture);
    }

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Err(err) = server::serve(config).await {
                eprintln!("server terminated: {err}");
                return Err(Box::new(err));
            }
        }
        Command::Query(cmd) => {
            server::install_tracing_subscriber();
            let coordinator = Arc::new(Coordinator::from_config(&config)?);
            let request = read_request(&cmd.request)?;
            run_query(&coordinator, &request, &cmd, cli.format).await?;
        }
        Command::Explain { request } => {
            let coordinator = Coordinator::from_config(&config)?;
            let explain = coordinator.explain(&read_request(&request)?)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&explain)?),
                OutputFormat::Text => {
                    print!("{}", explain.root.render());
                    println!("fingerprint: {:016x}", explain.fingerprint);
                }
            }
        }
        Command::Fields => {
            let schema = cohort::schema::FieldSchema::load(config.engine.schema_path.as_deref())?;
            let fields = schema.fields();
            match cli.format {
                OutputFormat::Json => {
                    let labels: Vec<_> = fields.iter().map(|def| def.label.as_str()).collect();
                    println!("{}", serde_json::to_string_pretty(&labels)?);
                }
                OutputFormat::Text => {
                    for def in fields {
                        let node = def.node.map(|n| n.as_str()).unwrap_or("-");
                        println!("{}\t{}\t{:?}", def.label, node, def.kind);
                    }
                }
            }
        }
    }

    Ok(())
}

fn read_request(path: &Path) -> Result<QueryRequest, Box<dyn Error>> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path)
            .map_err(|err| format!("failed to read request {}: {err}", path.display()))?
    };
    Ok(serde_json::from_str(&text)?)
}

async fn run_query(
    coordinator: &Arc<Coordinator>,
    request: &QueryRequest,
    cmd: &QueryCmd,
    format: OutputFormat,
) -> Result<(), Box<dyn Error>> {
    let plan = coordinator.prepare(request)?;
    let mut stream = coordinator.stream(plan);
    let spinner = spinner(cmd.quiet || cmd.ndjson);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut stdout = io::stdout().lock();

    loop {
        let event = tokio::select! {
            event = stream.events.recv() => event,
            _ = &mut interrupt => {
                stream.cancel.cancel();
                finish(&spinner);
                return Err("query interrupted".into());
            }
        };
        let Some(event) = event else {
            finish(&spinner);
            return Err("query ended without a result".into());
        };
        if cmd.ndjson {
            stdout.write_all(&event.to_ndjson()?)?;
            stdout.flush()?;
        }
        match event {
            QueryEvent::Fetching { fetching } => progress(&spinner, format!("fetched {fetching}")),
            QueryEvent::Processed { processed } => {
                progress(&spinner, format!("{processed} profiles fetched"))
            }
            QueryEvent::Mode { mode, groups } => {
                progress(&spinner, format!("{mode} over {groups} groups"))
            }
            QueryEvent::Group { group, query } => {
                progress(&spinner, format!("group {group}: {query}"))
            }
            QueryEvent::Data { data } => {
                finish(&spinner);
                if !cmd.ndjson {
                    match format {
                        OutputFormat::Json => {
                            writeln!(stdout, "{}", serde_json::to_string_pretty(&data)?)?
                        }
                        OutputFormat::Text => {
                            for profile in &data {
                                writeln!(stdout, "{}\tphase {}", profile.key, profile.phase)?;
                            }
                            writeln!(stdout, "{} matched", data.len())?;
                        }
                    }
                }
                return Ok(());
            }
            QueryEvent::Error { error } => {
                finish(&spinner);
                return Err(format!("query failed ({}): {}", error.status, error.message).into());
            }
        }
    }
}

fn spinner(hidden: bool) -> Option<ProgressBar> {
    if hidden || !io::stderr().is_terminal() {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    pb.enable_steady_tick(Duration::from_millis(80));
    Some(pb)
}

fn progress(pb: &Option<ProgressBar>, message: String) {
    if let Some(pb) = pb {
        pb.set_message(message);
    }
}

fn finish(pb: &Option<ProgressBar>) {
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
}
