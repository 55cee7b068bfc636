//! # Route Watch
//!
//! Long-running service that keeps protocol and venue state fresh and prints
//! every refresh snapshot, optionally quoting one route at startup.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin route_watch -- --config Config.toml --quote 1000 --direction deposit
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use dollar_route_sdk::{
    route::math::DOLLAR_DECIMALS,
    scheduler::RefreshSnapshot,
    types::{conversions::format_amount, Direction},
    OptimalRouteResult, SdkContext, Settings,
};
use ethers::types::{Address, U256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

/// `PRICE_PRECISION` expressed as decimals.
const PRICE_DECIMALS: u8 = 6;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    Deposit,
    Withdraw,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Deposit => Direction::Deposit,
            DirectionArg::Withdraw => Direction::Withdraw,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "route_watch", about = "Watch dollar routes and refresh snapshots")]
struct Args {
    /// Settings file; defaults to ./Config.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Account whose tracked-token balances are included in snapshots.
    #[arg(long)]
    account: Option<String>,

    /// Quote a route for this human-readable amount at startup.
    #[arg(long)]
    quote: Option<String>,

    #[arg(long, value_enum, default_value = "deposit")]
    direction: DirectionArg,

    /// Deposit: mint one-to-one with collateral only.
    #[arg(long)]
    force_collateral_only: bool,

    /// Withdraw: always swap on the venue.
    #[arg(long)]
    force_swap_only: bool,

    /// Run a single refresh, print it and exit.
    #[arg(long)]
    once: bool,

    /// Prometheus listener port.
    #[cfg(feature = "observability")]
    #[arg(long, default_value_t = 9000)]
    metrics_port: u16,
}

fn init_logging() {
    #[cfg(feature = "observability")]
    {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
    #[cfg(not(feature = "observability"))]
    env_logger::init();
}

#[cfg(feature = "observability")]
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("failed to install prometheus exporter")?;
    dollar_route_sdk::metrics::describe_metrics();
    println!("✅ Metrics exporter listening on :{}", port);
    Ok(())
}

fn print_snapshot(snapshot: &RefreshSnapshot) {
    let taken_at = Utc
        .timestamp_millis_opt(snapshot.taken_at_ms as i64)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| snapshot.taken_at_ms.to_string());
    println!(
        "{} tick #{} | CR {} | dollar ${} | gov ${} | venue rate {} | synthetic ${}",
        taken_at.dimmed(),
        snapshot.tick,
        format_amount(snapshot.protocol.collateral_ratio, PRICE_DECIMALS, 4),
        format_amount(snapshot.protocol.dollar_price, PRICE_DECIMALS, 4),
        format_amount(snapshot.protocol.governance_price, PRICE_DECIMALS, 4),
        format_amount(snapshot.venue.exchange_rate, DOLLAR_DECIMALS, 4),
        format_amount(snapshot.synthetic_dollar_price, PRICE_DECIMALS, 4).cyan(),
    );
    if let Some(balances) = &snapshot.balances {
        for balance in balances.values() {
            println!(
                "    {:<8} {:>20}  ${}",
                balance.symbol,
                format_amount(balance.balance, balance.decimals, 4),
                format_amount(balance.usd_value, PRICE_DECIMALS, 2)
            );
        }
        println!(
            "    {:<8} {:>20}  ${}",
            "total".bold(),
            "",
            format_amount(snapshot.total_usd_value(), PRICE_DECIMALS, 2).bold()
        );
    }
}

fn print_route(route: &OptimalRouteResult, output_decimals: u8) {
    let status = if route.is_enabled {
        "enabled".green()
    } else {
        "disabled".red()
    };
    println!(
        "🧭 {} route: {} ({}) -> {}",
        route.direction,
        route.route_type.to_string().bold(),
        status,
        format_amount(route.expected_output, output_decimals, 6)
    );
    if let Some(reason) = &route.disabled_reason {
        println!("   ⚠️  {}", reason.yellow());
    }
    if let Some(bonus) = route.bonus_amount {
        println!("   governance amount: {}", format_amount(bonus, DOLLAR_DECIMALS, 6));
    }
    println!("   {}", route.reason);
}

async fn quote_route(ctx: &SdkContext, args: &Args, raw: &str) -> Result<()> {
    let direction = Direction::from(args.direction);
    let collateral_decimals = ctx.settings.contracts.collateral_decimals;
    let (input_decimals, output_decimals) = match direction {
        Direction::Deposit => (collateral_decimals, DOLLAR_DECIMALS),
        Direction::Withdraw => (DOLLAR_DECIMALS, collateral_decimals),
    };
    let amount: U256 = ethers::utils::parse_units(raw, input_decimals as u32)
        .with_context(|| format!("invalid amount {}", raw))?
        .into();

    let route = match direction {
        Direction::Deposit => {
            ctx.get_optimal_deposit_route(amount, args.force_collateral_only)
                .await?
        }
        Direction::Withdraw => {
            ctx.get_optimal_withdraw_route(amount, args.force_swap_only)
                .await?
        }
    };
    print_route(&route, output_decimals);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    init_logging();

    let args = Args::parse();

    println!("🚀 Starting Route Watch");
    println!("═══════════════════════════════════════════════════════════════════\n");

    #[cfg(feature = "observability")]
    init_metrics(args.metrics_port)?;

    let settings = match &args.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::new()?,
    };
    println!("✅ Settings loaded (rpc: {})", settings.rpc.http_url);

    let ctx = SdkContext::from_settings(settings).await?;
    let restored = ctx.load_persisted().await;
    println!("✅ SDK context ready ({} cache entries restored)", restored);

    if let Some(raw) = args.account.as_deref() {
        let account: Address = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid account address {}: {}", raw, e))?;
        ctx.scheduler.set_account(Some(account));
    }

    if let Some(raw) = args.quote.as_deref() {
        if let Err(e) = quote_route(&ctx, &args, raw).await {
            eprintln!("❌ Route quote failed: {:#}", e);
        }
    }

    if args.once {
        match ctx.scheduler.force_refresh().await {
            Some(snapshot) => print_snapshot(&snapshot),
            None => eprintln!("❌ Refresh failed, see logs for details"),
        }
        return Ok(());
    }

    ctx.scheduler.subscribe(|snapshot: Arc<RefreshSnapshot>| print_snapshot(&snapshot));
    ctx.scheduler.start().await;
    println!(
        "✅ Refresh scheduler started (every {} ms). Press Ctrl+C to stop.\n",
        ctx.settings.scheduler.interval_ms
    );

    signal::ctrl_c().await?;
    println!("\n🛑 Shutting down...");
    ctx.scheduler.stop().await;
    for (category, stats) in ctx.cache_stats() {
        println!("   {:?}: {:?}", category, stats);
    }
    Ok(())
}
