//! Fetch one URL through a real browser and emit the rendered result.

use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use chrome_har_cli::browser::BrowserHandle;
use chrome_har_cli::cdp::{ChromiumSession, PageCommands, ProfileCookie, spawn_event_pump};
use chrome_har_cli::config::{EnvSettings, RecorderOptions, StabilityConfig, parse_duration};
use chrome_har_cli::filters::{FilterSpec, Filters};
use chrome_har_cli::har::to_pretty_json;
use chrome_har_cli::output;
use chrome_har_cli::session::{RecordingSession, WaitUntil};
use chrome_har_cli::timeouts::secs;
use chrome_har_cli::{HarError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Html,
    Text,
    Har,
    Screenshot,
    Cookies,
}

impl FromStr for OutputFormat {
    type Err = HarError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "html" => Ok(Self::Html),
            "text" => Ok(Self::Text),
            "har" => Ok(Self::Har),
            "screenshot" => Ok(Self::Screenshot),
            "cookies" => Ok(Self::Cookies),
            other => Err(HarError::config(
                "--format",
                format!("unknown format '{other}'"),
            )),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "churl")]
#[command(version, about = "Fetch a URL through a real browser")]
struct Cli {
    #[arg(help = "URL to fetch")]
    url: String,

    #[arg(short, long, help = "Output file (defaults to stdout)")]
    output: Option<PathBuf>,

    #[arg(long, default_value = "html", help = "html, text, har, screenshot or cookies")]
    format: String,

    #[arg(long, default_value = "load", help = "load, dom, networkIdle or stable")]
    wait: String,

    #[arg(long, help = "Overall timeout, e.g. 30s")]
    timeout: Option<String>,

    #[arg(long = "header", value_name = "K: V", help = "Extra request header, repeatable")]
    headers: Vec<String>,

    #[arg(long = "cookie", value_name = "K=V", help = "Cookie to set before navigating, repeatable")]
    cookies: Vec<String>,

    #[arg(long, help = "JSON-query projection (har format only)")]
    filter: Option<String>,

    #[arg(long, help = "Text template projection (har format only)")]
    template: Option<String>,

    #[arg(long, help = "Only capture URLs matching this regex (har format only)")]
    url_pattern: Option<String>,

    #[arg(long, help = "Cookie name regex (har format only)")]
    cookie_pattern: Option<String>,

    #[arg(long, help = "Block matching URLs (har format only)")]
    block_pattern: Option<String>,

    #[arg(long, help = "Omit matching URLs from output (har format only)")]
    omit_pattern: Option<String>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
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
    let format = OutputFormat::from_str(&cli.format)?;
    let wait = WaitUntil::from_str(&cli.wait)?;

    let timeout = match &cli.timeout {
        Some(raw) => parse_duration("--timeout", raw)?,
        None => env
            .timeout
            .unwrap_or(Duration::from_secs(secs::DEFAULT_TIMEOUT)),
    };

    let filters = Filters::compile(&FilterSpec {
        url_include: cli.url_pattern.clone(),
        block: cli.block_pattern.clone(),
        omit: cli.omit_pattern.clone(),
        cookie_name: cli.cookie_pattern.clone(),
        query: cli.filter.clone(),
        template: cli.template.clone(),
    })?;

    let extra_headers = parse_headers(&cli.headers)?;
    let seed_cookies = parse_cookies(&cli.cookies, &cli.url)?;

    let browser = BrowserHandle::launch(&env).await?;
    let page = browser.new_page().await?;
    let events = spawn_event_pump(&page).await?;
    let commands: Arc<ChromiumSession> = Arc::new(ChromiumSession::new(page));

    if !extra_headers.is_empty() {
        commands.set_extra_headers(extra_headers).await?;
    }
    for cookie in seed_cookies {
        commands.set_cookie(cookie).await?;
    }

    let options = RecorderOptions {
        websockets: format == OutputFormat::Har,
        ..Default::default()
    };
    let stability = StabilityConfig {
        verbose: cli.verbose,
        max_total_wait: timeout,
        ..Default::default()
    };

    let session = RecordingSession::new(commands.clone(), filters, stability, options, None);
    session.start(events).await?;
    session.navigate(&cli.url, wait, timeout).await?;

    let rendered = match format {
        OutputFormat::Html => commands.page_content().await?.into_bytes(),
        OutputFormat::Text => {
            let text = commands
                .evaluate("document.body ? document.body.innerText : ''")
                .await?;
            text.as_str().unwrap_or_default().as_bytes().to_vec()
        }
        OutputFormat::Har => {
            let har = session.stop().await?;
            to_pretty_json(&har)?.into_bytes()
        }
        OutputFormat::Screenshot => commands.screenshot_png().await?,
        OutputFormat::Cookies => {
            let cookies = commands.read_cookies().await?;
            serde_json::to_vec_pretty(&cookies)
                .map_err(|e| HarError::Serialization(e.to_string()))?
        }
    };

    session.close();
    browser.close().await;

    match &cli.output {
        Some(path) => output::write_artifact(path, &rendered)?,
        None => output::print_artifact(&rendered)?,
    }

    Ok(())
}

fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| {
                    HarError::config("--header", format!("expected 'K: V', got '{header}'"))
                })
        })
        .collect()
}

fn parse_cookies(raw: &[String], url: &str) -> Result<Vec<ProfileCookie>> {
    let domain = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    raw.iter()
        .map(|cookie| {
            cookie
                .split_once('=')
                .filter(|(name, _)| !name.trim().is_empty())
                .map(|(name, value)| ProfileCookie {
                    name: name.trim().to_string(),
                    value: value.trim().to_string(),
                    domain: domain.clone(),
                    path: "/".to_string(),
                    expires: None,
                    http_only: false,
                    secure: false,
                    same_site: None,
                })
                .ok_or_else(|| {
                    HarError::config("--cookie", format!("expected 'K=V', got '{cookie}'"))
                })
        })
        .collect()
}
