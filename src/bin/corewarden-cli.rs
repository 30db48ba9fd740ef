use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "corewarden-cli")]
#[command(about = "Management CLI for the corewarden engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081", env = "COREWARDEN_URL")]
    url: String,

    #[arg(short, long, env = "COREWARDEN_API_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Engine summary
    Status,
    /// Core process state, identity and running config
    Process,
    /// Unflushed traffic per client and inbound
    Ledger,
    /// Scheduled job records
    Jobs,
    /// Reconcile the core with the store now
    Reconcile {
        /// Queue the request and return immediately
        #[arg(long)]
        no_wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let base = cli.url.trim_end_matches('/');
    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Process => client.get(format!("{}/admin/process", base)),
        Commands::Ledger => client.get(format!("{}/admin/ledger", base)),
        Commands::Jobs => client.get(format!("{}/admin/jobs", base)),
        Commands::Reconcile { no_wait } => client
            .post(format!("{}/admin/reconcile", base))
            .query(&[("wait", (!no_wait).to_string())]),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
