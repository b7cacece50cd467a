use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use maskmagic_contracts::config::{AuthStrategy, RelayConfig, ServiceConfig};
use maskmagic_contracts::events::EventLog;
use maskmagic_engine::{
    fit_to_budget_with, generate_mask, prepare_with, BudgetPolicy, CanvasSpec, HttpTransport,
    MaskShape, Orchestrator, RasterImage, Relay, RelayServer, ReqwestTransport, DEFAULT_COVERAGE,
    RELAY_ROUTE,
};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DIAGNOSE_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Parser)]
#[command(name = "maskmagic", version, about = "Masked image edits through a generation backend")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full pipeline against the configured backend.
    Generate(GenerateArgs),
    /// Crop and resize an image to the service canvas.
    Prepare(PrepareArgs),
    /// Render an inpainting mask congruent to an image.
    Mask(MaskArgs),
    /// Shrink an image under a byte ceiling.
    Fit(FitArgs),
    /// Serve the backend relay, or pass one JSON request through it.
    Relay(RelayArgs),
    /// Print the effective configuration and test the endpoint connection.
    Diagnose(DiagnoseArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "circle")]
    mask: MaskShape,
    #[arg(long, default_value_t = DEFAULT_COVERAGE)]
    coverage: f64,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct PrepareArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct MaskArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = "circle")]
    shape: MaskShape,
    #[arg(long, default_value_t = DEFAULT_COVERAGE)]
    coverage: f64,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct FitArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    max_bytes: u64,
    #[arg(long)]
    min_dimension: Option<u32>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
#[command(group(ArgGroup::new("source").required(true).args(["request", "listen"])))]
struct RelayArgs {
    /// Request body file, or `-` for stdin.
    #[arg(long)]
    request: Option<String>,
    /// Serve the relay over HTTP on this address, e.g. 127.0.0.1:8080.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long, default_value = "POST")]
    method: String,
}

#[derive(Debug, Parser)]
struct DiagnoseArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    endpoint: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("maskmagic error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Prepare(args) => run_prepare(args),
        Command::Mask(args) => run_mask(args),
        Command::Fit(args) => run_fit(args),
        Command::Relay(args) => run_relay(args),
        Command::Diagnose(args) => run_diagnose(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref(), args.endpoint.as_deref())?;
    let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
    let mut orchestrator = Orchestrator::new(config, transport).with_coverage(args.coverage);
    if let Some(path) = &args.events {
        let events = EventLog::fresh(path);
        tracing::info!(invocation_id = events.invocation_id(), "writing events to {}", path.display());
        orchestrator = orchestrator.with_events(events);
    }

    let image = read_image(&args.image)?;
    let outcome = orchestrator.run(image, &args.prompt, args.mask);
    let trail: Vec<String> = outcome.trail.iter().map(ToString::to_string).collect();
    let output = outcome.result?;
    write_png(&args.out, &output)?;
    print_json(&json!({
        "out": args.out.display().to_string(),
        "width": output.width(),
        "height": output.height(),
        "trail": trail,
    }))?;
    Ok(0)
}

fn run_prepare(args: PrepareArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref(), None)?;
    let prepared = prepare_with(read_image(&args.image)?, &CanvasSpec::from_config(&config))?;
    write_png(&args.out, &prepared)?;
    print_json(&json!({
        "out": args.out.display().to_string(),
        "width": prepared.width(),
        "height": prepared.height(),
    }))?;
    Ok(0)
}

fn run_mask(args: MaskArgs) -> Result<i32> {
    let target = read_image(&args.image)?;
    let mask = generate_mask(&target, args.shape, args.coverage)?;
    write_png(&args.out, &mask)?;
    print_json(&json!({
        "out": args.out.display().to_string(),
        "shape": args.shape.as_str(),
        "geometry": mask.geometry().to_string(),
    }))?;
    Ok(0)
}

fn run_fit(args: FitArgs) -> Result<i32> {
    let mut policy = BudgetPolicy::new(args.max_bytes);
    if let Some(min_dimension) = args.min_dimension {
        policy.min_dimension = min_dimension;
    }
    let fitted = fit_to_budget_with(read_image(&args.image)?, &policy)?;
    fs::write(&args.out, &fitted.bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    print_json(&json!({
        "out": args.out.display().to_string(),
        "mime": fitted.encoding.mime(),
        "bytes": fitted.encoded_len(),
        "width": fitted.image.width(),
        "height": fitted.image.height(),
    }))?;
    Ok(0)
}

fn run_relay(args: RelayArgs) -> Result<i32> {
    let config = RelayConfig::from_env();
    let transport = ReqwestTransport::new(Duration::from_secs(
        ServiceConfig::default().request_timeout_secs,
    ))?;
    let relay = Relay::new(config, transport);

    if let Some(addr) = args.listen.as_deref() {
        let server = RelayServer::bind(addr, relay)?;
        let bound = server
            .local_addr()
            .map_or_else(|| addr.to_string(), |bound| bound.to_string());
        println!("Relay listening on http://{bound}{RELAY_ROUTE}");
        server.run()?;
        return Ok(0);
    }

    let request = args.request.as_deref().unwrap_or("-");
    let body = if request == "-" {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .context("failed reading request from stdin")?;
        buf
    } else {
        fs::read(request).with_context(|| format!("failed to read {request}"))?
    };
    let reply = relay.handle(&args.method, &body);
    let headers: serde_json::Map<String, Value> = reply
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect();
    print_json(&json!({
        "status": reply.status,
        "headers": headers,
        "body": reply.body,
    }))?;
    Ok(if reply.status < 400 { 0 } else { 1 })
}

fn run_diagnose(args: DiagnoseArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref(), args.endpoint.as_deref())?;
    print_json(&redacted(&config)?)?;

    let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
    println!("Testing connection to: {}", config.endpoint.url);
    match transport.get(&config.endpoint.url) {
        Ok(reply) => {
            println!("Status code: {}", reply.status);
            println!("Response: {}", preview(&reply.text(), DIAGNOSE_PREVIEW_CHARS));
            Ok(0)
        }
        Err(err) => {
            println!("Connection failed: {err}");
            Ok(1)
        }
    }
}

/// File (or defaults), then environment, then an explicit endpoint flag.
fn load_config(path: Option<&Path>, endpoint: Option<&str>) -> Result<ServiceConfig> {
    let mut config = match path {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    config.apply_env();
    if let Some(url) = endpoint {
        config.endpoint.url = url.trim_end_matches('/').to_string();
    }
    config.validate()?;
    Ok(config)
}

fn redacted(config: &ServiceConfig) -> Result<Value> {
    let mut shown = config.clone();
    if let AuthStrategy::Bearer { token } = &mut shown.endpoint.auth {
        *token = "<redacted>".to_string();
    }
    serde_json::to_value(&shown).context("failed to serialize config")
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

fn read_image(path: &Path) -> Result<RasterImage> {
    RasterImage::open(path).with_context(|| format!("failed to load {}", path.display()))
}

fn write_png(path: &Path, image: &RasterImage) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let bytes = image.encode_png()?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
