use amiko_pay::application::node::Node;
use amiko_pay::config::{self, NodeSettings};
use amiko_pay::interfaces::csv::payment_reader::PaymentReader;
use amiko_pay::interfaces::csv::report_writer::ReportWriter;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Payment legs CSV file (side, commit_hash, amount, meeting_point)
    payments: Option<PathBuf>,

    /// Accept amikolink connections on host:port
    #[arg(long)]
    listen: Option<String>,

    /// Link URI to open at start-up, e.g. amikolink://host:4321/<address>
    #[arg(long = "link")]
    links: Vec<String>,

    /// Hex public key presented to peers
    #[arg(long)]
    node_key: Option<String>,

    /// Hex public key of the meeting point served by this node
    #[arg(long)]
    meeting_point_key: Option<String>,

    /// Hex address of a peer allowed to connect (repeatable; default: any peer)
    #[arg(long = "trusted-peer")]
    trusted_peers: Vec<String>,

    /// Time a payment leg gets to be matched
    #[arg(long, default_value_t = 10_000)]
    route_timeout_ms: u64,

    /// Close links whose handshake takes longer than this
    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    /// Only match legs that carry the same amount
    #[arg(long)]
    strict_amounts: bool,

    /// Forget finished transactions
    #[arg(long)]
    reap_finished: bool,

    /// Keep serving for this many seconds after the payments are processed
    #[arg(long)]
    run_for_secs: Option<u64>,
}

impl Cli {
    fn settings(&self) -> Result<NodeSettings, amiko_pay::error::ConfigError> {
        Ok(NodeSettings {
            listen: self
                .listen
                .as_deref()
                .map(config::parse_listen_address)
                .transpose()?,
            links: self.links.clone(),
            node_key: self
                .node_key
                .as_deref()
                .map(|key| config::parse_key("node key", key))
                .transpose()?,
            meeting_point_key: self
                .meeting_point_key
                .as_deref()
                .map(|key| config::parse_key("meeting point key", key))
                .transpose()?,
            trusted_peers: self
                .trusted_peers
                .iter()
                .map(|peer| config::parse_address(peer))
                .collect::<Result<_, _>>()?,
            have_route_timeout: Duration::from_millis(self.route_timeout_ms),
            handshake_timeout: self.handshake_timeout_ms.map(Duration::from_millis),
            strict_amounts: self.strict_amounts,
            reap_finished: self.reap_finished,
            ..NodeSettings::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("amiko_pay=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.settings().into_diagnostic()?;
    let listening = settings.listen.is_some();
    let mut node = Node::start(settings).await.into_diagnostic()?;

    if let Some(path) = &cli.payments {
        let file = File::open(path).into_diagnostic()?;
        let mut legs = Vec::new();
        for leg in PaymentReader::new(file).payments() {
            match leg {
                Ok(leg) => legs.push(leg),
                Err(e) => warn!(error = %e, "skipping payment row"),
            }
        }

        let reports = node.process_payments(&legs).await;
        let stdout = io::stdout();
        ReportWriter::new(stdout.lock())
            .write_reports(&reports)
            .into_diagnostic()?;
    }

    let served = match cli.run_for_secs {
        Some(secs) => node.serve(Some(Duration::from_secs(secs))).await,
        None if listening && cli.payments.is_none() => node.serve(None).await,
        None => Ok(()),
    };
    node.shutdown().await;
    served.into_diagnostic()
}
