use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cdp_adapter::{DomObserver, Session};
use clap::{Args, Parser, Subcommand};
use feed_patch::{run_flow, Injector, RelayEvent, ScriptTemplate, TemplateParams};
use feedtap::config::{load_config, AppConfig};
use feedtap::cookies::session_cookie_present;
use feedtap::output::{render_event, render_node, OutputFormat};
use feedtap::watcher::Watcher;
use feedtap_event_bus::{to_mpsc, InMemoryBus};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Watch a live chat room's socket feed through a headless browser
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a room and print its feed until interrupted
    Watch(WatchArgs),
    /// Open a page and evaluate a templated script there
    Eval(EvalArgs),
    /// List cookies for the base address
    Cookies(CookiesArgs),
}

#[derive(Args)]
struct BrowserArgs {
    /// Remote debugging port
    #[arg(long)]
    port: Option<u16>,

    /// Show the browser window
    #[arg(long)]
    headful: bool,

    /// Attach to a running browser at this DevTools websocket URL
    #[arg(long, value_name = "URL")]
    ws_url: Option<String>,
}

#[derive(Args)]
struct WatchArgs {
    /// Room name, as it appears in the room's URL
    room: String,

    #[command(flatten)]
    browser: BrowserArgs,

    /// Also report DOM insertions in order
    #[arg(long)]
    observe_dom: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct EvalArgs {
    /// Page path relative to the base address
    path: String,

    /// Script template file
    script: PathBuf,

    /// Template parameter, substituted for `<NAME>`
    #[arg(long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,

    #[command(flatten)]
    browser: BrowserArgs,
}

#[derive(Args)]
struct CookiesArgs {
    /// Session cookie name to probe for
    #[arg(long, default_value = "sessionid")]
    name: String,

    #[command(flatten)]
    browser: BrowserArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.debug, cli.log_json)?;

    let loaded = load_config(cli.config.as_deref()).await?;
    let config = loaded.config;

    let result = match cli.command {
        Commands::Watch(args) => cmd_watch(args, config).await,
        Commands::Eval(args) => cmd_eval(args, config).await,
        Commands::Cookies(args) => cmd_cookies(args, config).await,
    };

    let counters = cdp_adapter::metrics::snapshot();
    debug!(
        commands = counters.commands,
        failures = counters.command_failures,
        events = counters.events,
        evaluation_failures = counters.evaluation_failures,
        "debugging session counters"
    );

    match result {
        Ok(()) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(level: &str, debug: bool, json: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn apply_browser_args(config: &mut AppConfig, args: &BrowserArgs) {
    if let Some(port) = args.port {
        config.cdp.port = port;
    }
    if args.headful {
        config.cdp.headless = false;
    }
    if let Some(url) = &args.ws_url {
        config.cdp.websocket_url = Some(url.clone());
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}

async fn cmd_watch(args: WatchArgs, mut config: AppConfig) -> Result<()> {
    apply_browser_args(&mut config, &args.browser);
    if args.observe_dom {
        config.cdp.observe_dom = true;
    }
    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    let session = Arc::new(Session::new(config.cdp.clone()));
    let injector = Arc::new(Injector::from_config(&config.patch));
    let bus = InMemoryBus::<RelayEvent>::new(config.bus_capacity);

    let mut feed = to_mpsc(bus.clone(), config.bus_capacity);
    let printer = tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            println!("{}", render_event(&event, format));
        }
    });

    let dom = config.cdp.observe_dom.then(|| {
        let mut observer = DomObserver::spawn(session.clone(), config.bus_capacity);
        tokio::spawn(async move {
            while let Some(node) = observer.next().await {
                println!("{}", render_node(&node, format));
            }
        })
    });

    let watcher = Watcher::new(session, injector, bus);
    let outcome = watcher.run(&args.room, shutdown_signal()).await;

    // the bridge closes once the last bus handle is gone; print what it still holds
    drop(watcher);
    if let Err(err) = printer.await {
        error!("Feed printer failed: {}", err);
    }
    if let Some(dom) = dom {
        dom.abort();
    }
    outcome.context("watch ended with an error")
}

fn parse_params(raw: &[String]) -> Result<TemplateParams> {
    let mut params = TemplateParams::new();
    for pair in raw {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("parameter `{pair}` is not NAME=VALUE");
        };
        params.insert(name.to_string(), value.to_string());
    }
    Ok(params)
}

async fn cmd_eval(args: EvalArgs, mut config: AppConfig) -> Result<()> {
    apply_browser_args(&mut config, &args.browser);
    let params = parse_params(&args.params)?;
    let template = ScriptTemplate::load(&args.script)?;

    let session = Session::new(config.cdp.clone());
    session.start().await.context("Failed to start browser session")?;
    let result = run_flow(&session, &args.path, &template, &params).await;
    session.stop().await;

    match result.context("Scripted flow failed")? {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("null"),
    }
    Ok(())
}

async fn cmd_cookies(args: CookiesArgs, mut config: AppConfig) -> Result<()> {
    apply_browser_args(&mut config, &args.browser);

    let session = Session::new(config.cdp.clone());
    session.start().await.context("Failed to start browser session")?;
    let result = session.cookies().await;
    session.stop().await;

    let cookies = result.context("Failed to read cookies")?;
    let present = session_cookie_present(&cookies, &args.name);
    for cookie in &cookies {
        println!("{}\t{}\t{}", cookie.domain, cookie.name, cookie.value);
    }
    println!("session cookie `{}` present: {}", args.name, present);
    Ok(())
}
