//! Diagnostic tool - Check which settings the indexer will see
//!
//! Run with: cargo run --bin diagnose

use std::env;

fn is_set(key: &str) -> bool {
    env::var(key).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

fn mark(ok: bool) -> &'static str {
    if ok { "✅ Set" } else { "❌ Not set" }
}

/// Keep only the first characters of a secret
fn redact(value: &str) -> String {
    let head: String = value.chars().take(4).collect();
    format!("{}****", head)
}

fn main() {
    println!("🔍 POOL FEE INDEXER DIAGNOSTIC CHECK\n");

    // Load .env
    dotenvy::dotenv().ok();

    println!("═══════════════════════════════════════════════════");
    println!("                     REQUIRED                       ");
    println!("═══════════════════════════════════════════════════\n");

    let rpc = is_set("RPC_URL") || is_set("INFURA_API_KEY");
    let pool = is_set("UNISWAP_POOL_ADDRESS");
    let etherscan = is_set("ETHERSCAN_API_KEY");
    let database = is_set("DATABASE_URL");

    println!("  RPC_URL / INFURA_API_KEY:  {}", mark(rpc));
    println!("  UNISWAP_POOL_ADDRESS:      {}", mark(pool));
    println!("  ETHERSCAN_API_KEY:         {}", mark(etherscan));
    println!("  DATABASE_URL:              {}", mark(database));

    if let Ok(addr) = env::var("UNISWAP_POOL_ADDRESS") {
        if addr.trim().parse::<alloy_primitives::Address>().is_err() {
            println!("\n  ⚠️  UNISWAP_POOL_ADDRESS is not a valid address: {}", addr);
        }
    }

    println!("\n═══════════════════════════════════════════════════");
    println!("                     OPTIONAL                       ");
    println!("═══════════════════════════════════════════════════\n");

    let optional = [
        ("BINANCE_API_KEY", "(public klines need no key)"),
        ("REDIS_QUEUE_URL", "redis://redis-queue:6379"),
        ("REDIS_CACHE_URL", "redis://redis-cache:6379"),
        ("PRICE_SYMBOL", "ETHUSDT"),
        ("WORKER_CONCURRENCY", "1"),
        ("JOB_ATTEMPTS", "5"),
        ("JOB_BACKOFF_MS", "5000"),
        ("LOG_POLL_INTERVAL_MS", "4000"),
    ];

    for (key, default) in optional {
        match env::var(key) {
            Ok(value) if key.ends_with("_KEY") => println!("  {}: {} (from .env)", key, redact(&value)),
            Ok(value) => println!("  {}: {} (from .env)", key, value),
            Err(_) => println!("  {}: {} (default)", key, default),
        }
    }

    println!("\n═══════════════════════════════════════════════════");
    println!("                     STATUS                         ");
    println!("═══════════════════════════════════════════════════\n");

    if rpc && pool {
        println!("  📡 Live listener:  ready");
    } else {
        println!("  📡 Live listener:  disabled (needs RPC and pool address)");
    }
    if etherscan && pool {
        println!("  📜 Backfill:       ready");
    } else {
        println!("  📜 Backfill:       disabled (needs ETHERSCAN_API_KEY and pool address)");
    }
    if database {
        println!("  👷 Worker:         ready");
    } else {
        println!("  👷 Worker:         cannot store records without DATABASE_URL");
    }

    println!("\n✅ Diagnostic complete!\n");
}
