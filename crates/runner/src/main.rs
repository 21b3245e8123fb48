//! Trading kernel runner.
//!
//! Wires the market ingestor, strategy engine, risk manager, order
//! executor and supervisor together, then waits for operator commands.
//! The engine starts in `Stopped`; pass `--start` to issue the initial
//! `Start` command from the CLI, or drive it through the engine handle.
//!
//! ```bash
//! TRADING_MODE=paper DATABASE_URL=sqlite://bot.db cargo run --release
//! TRADING_MODE=paper DATABASE_URL=sqlite://bot.db cargo run --release -- --start
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use auth::ApiCredentials;
use binance_rest::BinanceRestClient;
use common::{BinanceEnvironment, Config};
use connector_binance::MarketStream;
use engine::{run_position_audit, EngineHandle, OrderExecutor, Supervisor};
use exchange_core::{create_price_book, ExchangeClient};
use ledger::PositionLedger;
use model::{EngineCommand, EngineState, TradingMode};
use paper::PaperClient;
use risk::{create_accounting, ExposureLimit, RiskConfig, RiskManager, MAX_OPEN_ORDERS};
use strategy::{StrategyEngine, StrategyFileConfig};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn exit_with(message: String) -> ! {
    eprintln!("ERROR: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    common::init_logging();

    let mut auto_start = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--start" => auto_start = true,
            "--help" | "-h" => {
                eprintln!("Usage: clawd [--start]");
                eprintln!();
                eprintln!("  --start   issue the Start command immediately after wiring");
                eprintln!();
                eprintln!("Configuration comes from the environment; see .env.example.");
                return;
            }
            other => exit_with(format!("unknown option '{other}'")),
        }
    }

    let config = Config::from_env().unwrap_or_else(|e| exit_with(e.to_string()));
    info!(mode = %config.trading_mode, "trading kernel starting");

    let strategy_file = StrategyFileConfig::load(&config.strategy_config_path)
        .unwrap_or_else(|e| exit_with(e.to_string()));
    let pairs = strategy_file.pairs();
    if pairs.is_empty() {
        exit_with(format!(
            "no strategies configured in '{}'",
            config.strategy_config_path
        ));
    }
    let strategy_engine =
        StrategyEngine::from_config(&strategy_file).unwrap_or_else(|e| exit_with(e.to_string()));

    let ledger = Arc::new(
        PositionLedger::open(&config.database_url, config.trading_mode)
            .await
            .unwrap_or_else(|e| exit_with(format!("cannot open ledger: {e}"))),
    );

    let price_book = create_price_book();
    let accounting = create_accounting(config.portfolio_value_usd);
    let environment = BinanceEnvironment::from_env();

    // The client is handed to the executor and the audit task only; the
    // rest of the pipeline has no path to the exchange.
    let client: Arc<dyn ExchangeClient> = match config.trading_mode {
        TradingMode::Live => {
            let credentials =
                ApiCredentials::from_env().unwrap_or_else(|e| exit_with(e.to_string()));
            info!(environment = %environment, "live trading against Binance");
            Arc::new(
                BinanceRestClient::new(credentials, environment)
                    .unwrap_or_else(|e| exit_with(e.to_string())),
            )
        }
        TradingMode::Paper => {
            info!(slippage_bps = %config.paper_slippage_bps, "paper trading");
            Arc::new(PaperClient::new(
                price_book.clone(),
                config.paper_slippage_bps,
            ))
        }
    };

    let risk_config = RiskConfig {
        stop_loss_pct: config.stop_loss_pct,
        take_profit_pct: config.take_profit_pct,
        max_exposure_per_trade: match (
            config.max_exposure_per_trade_pct,
            config.max_exposure_per_trade_usd,
        ) {
            (Some(fraction), _) => ExposureLimit::PortfolioFraction(fraction),
            (None, Some(usd)) => ExposureLimit::AbsoluteUsd(usd),
            (None, None) => RiskConfig::default().max_exposure_per_trade,
        },
        max_drawdown_pct: config.max_drawdown_pct,
    };

    // ── Channels ────────────────────────────────────────────────────────
    let (market_tx, _) = broadcast::channel(1024);
    let (event_tx, _) = broadcast::channel(256);
    let (signal_tx, signal_rx) = mpsc::channel(256);
    // Sized so a full complement of in-flight orders never blocks risk
    let (order_tx, order_rx) = mpsc::channel((MAX_OPEN_ORDERS * 2) as usize);
    let (command_tx, command_rx) = mpsc::channel(16);
    let (control_tx, control_rx) = mpsc::channel(8);
    let (audit_tx, audit_rx) = mpsc::channel(4);
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(EngineState::Stopped);
    let (ready_tx, ready_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Subsystems ──────────────────────────────────────────────────────
    let stream = MarketStream::new(
        pairs.clone(),
        environment,
        market_tx.clone(),
        price_book.clone(),
        audit_tx,
        ready_tx,
    );

    let risk_manager = RiskManager::new(
        risk_config,
        ledger.clone(),
        price_book.clone(),
        accounting.clone(),
        state_rx.clone(),
        signal_rx,
        control_rx,
        market_tx.subscribe(),
        event_tx.subscribe(),
        order_tx,
        event_tx.clone(),
    );

    let executor = OrderExecutor::new(
        order_rx,
        client.clone(),
        ledger.clone(),
        accounting.clone(),
        event_tx.clone(),
    );

    let supervisor = Supervisor::new(
        command_rx,
        state_tx,
        control_tx,
        event_tx.clone(),
        ready_rx,
        accounting.clone(),
        ledger.clone(),
    );

    let handle = EngineHandle::new(
        command_tx,
        state_rx.clone(),
        event_tx.clone(),
        ledger.clone(),
        accounting,
        price_book,
    );

    tokio::spawn(stream.run(shutdown_rx));
    tokio::spawn(run_position_audit(
        audit_rx,
        client,
        ledger,
        event_tx.clone(),
    ));
    tokio::spawn(strategy_engine.run(
        market_tx.subscribe(),
        signal_tx,
        state_rx,
        event_tx.clone(),
        reload_rx,
    ));
    tokio::spawn(risk_manager.run());
    tokio::spawn(executor.run());
    tokio::spawn(supervisor.run());

    // SIGHUP hot-reloads the strategy file without touching positions.
    #[cfg(unix)]
    {
        let path = config.strategy_config_path.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "SIGHUP handler unavailable, hot reload disabled");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                match StrategyFileConfig::load(&path) {
                    Ok(file) => {
                        info!(strategies = file.strategies.len(), "reloading strategy registry");
                        if reload_tx.send(file).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => error!(error = %e, "strategy reload failed, keeping registry"),
                }
            }
        });
    }

    // Event log subscriber: the seat a dashboard or chat-bot would take.
    {
        let mut events = handle.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => info!(event = ?event, "engine event"),
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "event logger lagged")
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    // Periodic health snapshot.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
            loop {
                interval.tick().await;
                let snapshot = handle.snapshot();
                info!(
                    state = %snapshot.state,
                    positions = snapshot.positions.len(),
                    unrealized = %snapshot.unrealized_pnl,
                    realized_24h = %snapshot.realized_pnl_24h,
                    open_orders = snapshot.open_order_count,
                    drawdown = %snapshot.drawdown,
                    "health"
                );
            }
        });
    }

    if auto_start {
        match handle.command(EngineCommand::Start).await {
            model::CommandOutcome::Accepted => info!("engine started"),
            model::CommandOutcome::Denied(reason) => {
                error!(reason = %reason, "start command denied")
            }
        }
    } else {
        info!("engine idle in stopped state, awaiting commands");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, stopping engine");

    match handle.command(EngineCommand::Stop).await {
        model::CommandOutcome::Accepted => info!("engine stopped cleanly"),
        model::CommandOutcome::Denied(reason) => info!(reason = %reason, "engine already stopped"),
    }
    let _ = shutdown_tx.send(true);
    info!("shutdown complete");
}
