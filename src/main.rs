use clap::Parser;
use futures::StreamExt;
use querycache::{Defaults, QueryClient, QueryFn, QueryOptions, impl_structural};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of leading attempts that fail
    #[arg(short, long, default_value_t = 1)]
    failures: u32,

    /// Retries per fetch
    #[arg(short, long, default_value_t = 2)]
    retry: u32,

    /// Delay between retries
    #[arg(long, default_value_t = 200)]
    retry_delay_ms: u64,

    /// Cache keys kept per query
    #[arg(short, long, default_value_t = 2)]
    caching: usize,

    /// Params to fetch, in order
    #[arg(short, long, value_delimiter = ',', default_value = "1,2,1")]
    keys: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
struct Page {
    page: u32,
    items: Vec<String>,
}

impl_structural!(Page { page, items });

#[derive(Debug, Clone, Serialize)]
struct PageParam {
    page: u32,
}

fn flaky_pages(failures: u32) -> QueryFn<Page, PageParam> {
    let calls = Arc::new(AtomicU32::new(0));
    QueryFn::from_async(move |param: PageParam| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if call < failures {
                anyhow::bail!("simulated outage on call {call}");
            }
            Ok(Page {
                page: param.page,
                items: (0..3).map(|i| format!("item {}-{i}", param.page)).collect(),
            })
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    Defaults::install(Defaults::from_env()?)?;

    let client = QueryClient::new();
    tokio::select! {
        result = run(&client, args) => result?,
        _ = tokio::signal::ctrl_c() => info!("🛑 Interrupted"),
    }
    client.clear();
    Ok(())
}

async fn run(client: &QueryClient, args: Args) -> anyhow::Result<()> {
    let options = QueryOptions::new("pages", Page::default(), flaky_pages(args.failures))
        .with_retry(args.retry)
        .with_retry_delay(Duration::from_millis(args.retry_delay_ms))
        .with_caching(args.caching)
        .with_min_valid_reconnect_time(Duration::ZERO);
    let query = client.register_query(options)?;

    let mut status = query.status()?;
    tokio::spawn(async move {
        while let Some(status) = status.next().await {
            info!(
                "📊 status: page {} loading={} error={:?}",
                status.data.page,
                status.loading,
                status.error.as_ref().map(ToString::to_string)
            );
        }
    });

    let mut responses = query.response();
    for page in args.keys {
        query.fetch(PageParam { page })?;
        match responses.next().await {
            Some(response) if response.is_success() => info!("📬 page {page} loaded"),
            Some(response) => warn!("📭 page {page} failed: {:?}", response.error()),
            None => break,
        }
    }

    info!("🔌 Simulating a network drop");
    client.environment().set_online(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.environment().set_online(true);
    if let Ok(Some(response)) = tokio::time::timeout(Duration::from_secs(2), responses.next()).await {
        info!("🔁 refetch after reconnect: success={}", response.is_success());
    } else {
        info!("🎯 data still fresh, no refetch after reconnect");
    }
    Ok(())
}
