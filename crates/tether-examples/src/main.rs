use facet::Facet;
use figue as args;
use tether::RuntimeOptions;

mod bridge;
mod scenarios;

type AnyResult<T> = Result<T, String>;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Label for the runtime in logs and snapshots (default: $TETHER_NODE_NAME or "tether").
    #[facet(args::named, default)]
    node_name: Option<String>,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    /// Bounce a counter across a message pipe between two tasks.
    PingPong {
        #[facet(args::named, default)]
        rounds: Option<u32>,
    },
    /// Stream bytes through a data pipe with two-phase reads and writes.
    DataStream {
        #[facet(args::named, default)]
        total_bytes: Option<u64>,
        #[facet(args::named, default)]
        capacity: Option<u32>,
    },
    /// Move a pipe endpoint into a second runtime and talk to it over frames.
    RemoteLoopback {
        #[facet(args::named, default)]
        messages: Option<u32>,
    },
    /// Trip and clear a receive-queue quota.
    QuotaBackpressure {
        #[facet(args::named, default)]
        limit: Option<u64>,
    },
    /// Print a JSON snapshot of a populated runtime.
    Snapshot,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut options = RuntimeOptions::from_env();
    if let Some(name) = cli.node_name {
        options = options.node_name(name);
    }
    dispatch_command(options, cli.command).await
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("tether-examples")
                .description("Run tether scenarios as subcommands")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

async fn dispatch_command(options: RuntimeOptions, command: CommandKind) -> AnyResult<()> {
    match command {
        CommandKind::PingPong { rounds } => {
            scenarios::ping_pong::run(options, rounds.unwrap_or(1_000)).await
        }
        CommandKind::DataStream {
            total_bytes,
            capacity,
        } => {
            scenarios::data_stream::run(
                options,
                total_bytes.unwrap_or(1 << 20),
                capacity.unwrap_or(4096),
            )
            .await
        }
        CommandKind::RemoteLoopback { messages } => {
            scenarios::remote_loopback::run(options, messages.unwrap_or(100)).await
        }
        CommandKind::QuotaBackpressure { limit } => {
            scenarios::quota_backpressure::run(options, limit.unwrap_or(8)).await
        }
        CommandKind::Snapshot => scenarios::snapshot::run(options).await,
    }
}
