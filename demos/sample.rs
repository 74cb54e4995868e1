use request_miner::{BackoffOptions, Miner, Request, SendOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The host owns logging; `info` also shows the backoff messages.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://www.google.com".to_owned());

    let miner = Miner::new();
    let request = Request::get(url).prepare()?;

    let backoff = BackoffOptions::new()
        .backoff_type("expo")
        .max_tries(3)
        .max_time(10.0)
        .exception_names(["RequestException"])
        .raise_on_giveup(true);

    let response = miner
        .process_request(&request, &SendOptions::default(), backoff)
        .await?;

    if let Some(response) = response {
        println!("{} {} bytes", response.status(), response.body().len());
    }

    Ok(())
}
