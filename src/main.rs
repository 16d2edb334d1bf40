//! Learning Chat - Entry Point
//!
//! Runs the engine against the console adapter: one chat message per stdin
//! line, bot output on stdout, logs on stderr.

use learning_chat::{
    serve_lines, ChatStore, Config, ConsoleAdapter, Dispatcher, LearningChat, Pacing,
    SettingsManager, SpeakScheduler,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Learning Chat v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: learning-chat");
        println!();
        println!("Reads chat lines from stdin:");
        println!("  <group_id> <user_id> [^<reply_to_id>] <text>");
        println!();
        println!("Environment variables:");
        println!("  LEARNING_CHAT_DB_PATH         SQLite database path");
        println!("  LEARNING_CHAT_SETTINGS        TOML settings file");
        println!("  LEARNING_CHAT_SPEAK_INTERVAL  Seconds between speak ticks (default: 180)");
        println!("  LEARNING_CHAT_SELF_ID         Bot account id (default: 0)");
        println!("  RUST_LOG                      trace|debug|info|warn|error");
        return Ok(());
    }

    // Stdout is the chat transcript, so logs go to stderr
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Learning Chat v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let settings = Arc::new(SettingsManager::load(&config.settings_path)?);
    let store = Arc::new(ChatStore::open(&config.db_path)?);
    let adapter = Arc::new(ConsoleAdapter::new());

    let engine = Arc::new(LearningChat::new(
        store.clone(),
        settings,
        adapter.clone(),
        config.self_id,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        adapter.clone(),
        store,
        engine.random(),
        Pacing::default(),
        config.self_id,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(SpeakScheduler::new(
        engine.clone(),
        dispatcher.clone(),
        config.speak_interval,
    ));
    let speak_task = tokio::spawn(scheduler.run(shutdown_rx));

    let stdin = BufReader::new(tokio::io::stdin());
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    let handled = serve_lines(stdin, &adapter, engine, dispatcher, ctrl_c).await?;

    info!("Shutting down after {} messages", handled);
    shutdown_tx.send(true).ok();
    speak_task.await?;
    Ok(())
}
