use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;

use chrome_har_cli::Result;
use chrome_har_cli::browser::BrowserHandle;
use chrome_har_cli::cdp::{ChromiumSession, spawn_event_pump};
use chrome_har_cli::config::{EnvSettings, RecorderOptions, StabilityConfig};
use chrome_har_cli::filters::{FilterSpec, Filters};
use chrome_har_cli::har::to_pretty_json;
use chrome_har_cli::output;
use chrome_har_cli::session::{RecordingSession, WaitUntil};
use chrome_har_cli::timeouts::secs;

#[derive(Parser, Debug)]
#[command(name = "chrome-har")]
#[command(version, about = "Record browser traffic to HAR 1.2 over CDP")]
struct Cli {
    #[arg(short, long, help = "Output file (defaults to stdout)")]
    output: Option<PathBuf>,

    #[arg(long, help = "URL to navigate to; omit to record until Ctrl-C")]
    url: Option<String>,

    #[arg(long, help = "JSON-query projection applied to each entry")]
    filter: Option<String>,

    #[arg(long, help = "Text template applied to each entry")]
    template: Option<String>,

    #[arg(long, help = "Only capture URLs matching this regex")]
    url_pattern: Option<String>,

    #[arg(long, help = "Only record cookies whose name matches this regex")]
    cookie_pattern: Option<String>,

    #[arg(long, help = "Instruct the browser to block matching URLs")]
    block_pattern: Option<String>,

    #[arg(long, help = "Drop matching URLs from the output")]
    omit_pattern: Option<String>,

    #[arg(long, help = "Emit entries as they complete, one JSON object per line")]
    stream: bool,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(long, help = "Record WebSocket traffic into the HAR")]
    websockets: bool,

    #[arg(long, help = "Navigation/stability timeout, e.g. 30s")]
    timeout: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose || std::env::var("DEBUG").is_ok());

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = if verbose {
        EnvFilter::new("debug").add_directive("chromiumoxide=info".parse().unwrap())
    } else {
        EnvFilter::from_default_env()
            .add_directive("warn".parse().unwrap())
            .add_directive("chromiumoxide=off".parse().unwrap())
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let env = EnvSettings::from_env()?;

    let filters = Filters::compile(&FilterSpec {
        url_include: cli.url_pattern.clone(),
        block: cli.block_pattern.clone(),
        omit: cli.omit_pattern.clone(),
        cookie_name: cli.cookie_pattern.clone(),
        query: cli.filter.clone(),
        template: cli.template.clone(),
    })?;

    let timeout = match &cli.timeout {
        Some(raw) => chrome_har_cli::config::parse_duration("--timeout", raw)?,
        None => env
            .timeout
            .unwrap_or(Duration::from_secs(secs::DEFAULT_TIMEOUT)),
    };

    let options = RecorderOptions {
        streaming: cli.stream,
        websockets: cli.websockets,
        ..Default::default()
    };
    let stability = StabilityConfig {
        verbose: cli.verbose,
        max_total_wait: timeout,
        ..Default::default()
    };

    let sink = if cli.stream {
        Some(Arc::new(Mutex::new(output::stream_sink(
            cli.output.as_deref(),
        )?)))
    } else {
        None
    };

    let browser = BrowserHandle::launch(&env).await?;
    let page = browser.new_page().await?;
    let events = spawn_event_pump(&page).await?;
    let commands = Arc::new(ChromiumSession::new(page));

    let session = RecordingSession::new(commands, filters, stability, options, sink);
    session.start(events).await?;

    match &cli.url {
        Some(url) => {
            session.navigate(url, WaitUntil::Stable, timeout).await?;
        }
        None => {
            eprintln!("Recording; press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
        }
    }

    let har = session.stop().await?;
    session.close();
    browser.close().await;

    if !cli.stream {
        match &cli.output {
            Some(path) => output::write_har(&har, path)?,
            None => println!("{}", to_pretty_json(&har)?),
        }
    }

    Ok(())
}
