use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mqtt_recon::types::BrokerScanResult;
use mqtt_recon::{netdetect, ports, scanner, Credentials, ScanOptions, ScanTarget};

/// mqtt-recon: audit MQTT brokers for anonymous access, weak TLS and exposed topics.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mqtt-recon",
    version,
    about = "Audit MQTT brokers for anonymous access, weak TLS and exposed topics.",
    long_about = None
)]
struct Cli {
    /// Host, IP address or IPv4 CIDR (e.g. 192.168.1.0/24). If omitted, auto-detect local /24 networks.
    #[arg(long)]
    target: Option<String>,

    /// Broker ports, inline (`1883,8883/tls`) or a path to a ports file. Defaults to 1883 and 8883.
    #[arg(long)]
    ports: Option<String>,

    /// Username for the credentialed retry.
    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// Password for the credentialed retry.
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Max hosts scanned concurrently.
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// TCP probe timeout in milliseconds.
    #[arg(long = "probe-timeout-ms", default_value_t = 2000)]
    probe_timeout_ms: u64,

    /// How long to wait for the broker to answer the MQTT handshake, in milliseconds.
    #[arg(long = "connect-wait-ms", default_value_t = 4000)]
    connect_wait_ms: u64,

    /// Listening window after a successful connect, in milliseconds.
    #[arg(long = "listen-ms", default_value_t = 2000)]
    listen_ms: u64,

    /// TLS certificate handshake timeout in milliseconds.
    #[arg(long = "cert-timeout-ms", default_value_t = 3000)]
    cert_timeout_ms: u64,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Log output format.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    let opts = ScanOptions {
        ports: ports::resolve_broker_ports(cli.ports.as_deref())?,
        concurrency: cli.concurrency,
        probe_timeout: Duration::from_millis(cli.probe_timeout_ms),
        connect_wait: Duration::from_millis(cli.connect_wait_ms),
        listen_window: Duration::from_millis(cli.listen_ms),
        cert_timeout: Duration::from_millis(cli.cert_timeout_ms),
        ..ScanOptions::default()
    };

    let credentials = match (cli.username.as_deref(), cli.password.as_deref()) {
        (Some(u), p) => Some(Credentials::new(u, p.unwrap_or_default())),
        (None, Some(_)) => {
            warn!("password given without username; credentialed retry disabled");
            None
        }
        (None, None) => None,
    };

    println!("mqtt-recon configuration:");
    println!(
        "  target       : {}",
        cli.target
            .as_deref()
            .unwrap_or("<auto-detect local IPv4 /24>")
    );
    println!(
        "  ports        : {}",
        opts.ports
            .iter()
            .map(|p| format!("{} ({})", p.port, p.label()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  credentials  : {}",
        credentials
            .as_ref()
            .map(|c| c.username.as_str())
            .unwrap_or("<none>")
    );
    println!("  concurrency  : {}", opts.concurrency);
    println!("  connect_wait : {:?}", opts.connect_wait);
    println!("  listen       : {:?}", opts.listen_window);
    println!(
        "  output       : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let results = match cli.target.as_deref() {
        Some(t) => {
            let target: ScanTarget = t.parse().with_context(|| format!("bad --target {t}"))?;
            scanner::scan(&target, credentials.as_ref(), &opts).await?
        }
        None => {
            let cidrs = netdetect::detect_local_cidrs()
                .context("failed to detect local networks; pass --target")?;
            if cidrs.is_empty() {
                return Err(anyhow!("no local IPv4 networks found; pass --target"));
            }
            let mut hosts = Vec::new();
            println!("Detected local IPv4 networks:");
            for cidr in cidrs {
                let expanded = netdetect::expand_ipv4_hosts(cidr)?;
                println!("  - {} ({} hosts)", cidr, expanded.len());
                hosts.extend(expanded.into_iter().map(|ip| ip.to_string()));
            }
            scanner::scan_hosts(&hosts, credentials.as_ref(), &opts).await
        }
    };

    print_results_table(&results);

    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &results)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON results to {}", path.display());
    }

    Ok(())
}

fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn print_results_table(results: &[BrokerScanResult]) {
    let host_w = results
        .iter()
        .map(|r| r.attempt.host.len())
        .max()
        .unwrap_or(0)
        .max("host".len());
    let class_w = results
        .iter()
        .map(|r| r.attempt.classification.as_str().len())
        .max()
        .unwrap_or(0)
        .max("classification".len());
    let port_w = 5usize;
    let risk_w = "CRITICAL".len();
    let topics_w = "topics".len();
    let cert_w = "cert".len();

    let open = results
        .iter()
        .filter(|r| r.attempt.classification != mqtt_recon::Classification::ClosedOrUnreachable)
        .count();
    println!("\nBroker ports answering: {} (scanned: {})", open, results.len());
    println!(
        "{:<host_w$}  {:>port_w$}  {:<class_w$}  {:<risk_w$}  {:>topics_w$}  {:>cert_w$}",
        "host", "port", "classification", "risk", "topics", "cert",
    );
    println!(
        "{:-<host_w$}  {:-<port_w$}  {:-<class_w$}  {:-<risk_w$}  {:-<topics_w$}  {:-<cert_w$}",
        "", "", "", "", "", "",
    );
    for r in results {
        let cert = match r.certificate.as_ref() {
            Some(c) => match (c.score, c.grade) {
                (Some(s), Some(g)) => format!("{s} {g}"),
                _ => "err".to_string(),
            },
            None => "-".to_string(),
        };
        let topics = r.publishers.len() + r.sys_topics.len();
        println!(
            "{:<host_w$}  {:>port_w$}  {:<class_w$}  {:<risk_w$}  {:>topics_w$}  {:>cert_w$}",
            r.attempt.host,
            r.attempt.port,
            r.attempt.classification.as_str(),
            r.summary.risk_level.to_string(),
            topics,
            cert,
        );
    }

    for r in results.iter().filter(|r| !r.summary.issues.is_empty()) {
        println!(
            "\n{}:{} [{}]",
            r.attempt.host, r.attempt.port, r.summary.risk_level
        );
        for issue in &r.summary.issues {
            println!("  ! {issue}");
        }
        for rec in &r.summary.recommendations {
            println!("  > {rec}");
        }
    }
}

fn write_results_json(path: &Path, results: &[BrokerScanResult]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}
