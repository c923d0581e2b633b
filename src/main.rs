use anyhow::Context;
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use softphone::engine::loopback::LoopbackEngine;
use softphone::{
    ConfigStore, MemoryStore, Notification, NotificationLevel, PresenceStatus,
    SessionOrchestrator, SipEndpointConfig, SoftphoneHandle, SoftphoneSettings,
};

const HELP: &str = "commands: call <target> | answer | hangup | mute | hold | dtmf <digit> \
                    | audio | status <online|away|offline> | reconnect | reload | state | quit";

/// Account from `SOFTPHONE_*` variables; falls back to a demo account
fn account_from_env() -> anyhow::Result<SipEndpointConfig> {
    let var = |name: &str, default: &str| env::var(name).unwrap_or_else(|_| default.to_string());

    let mut config = SipEndpointConfig::new(
        var("SOFTPHONE_SERVER", "pbx.example.com"),
        var("SOFTPHONE_USERNAME", "1001"),
        var("SOFTPHONE_PASSWORD", "secret"),
    );
    if let Ok(port) = env::var("SOFTPHONE_PORT") {
        let port = port
            .parse()
            .with_context(|| format!("SOFTPHONE_PORT is not a port: {:?}", port))?;
        config = config.with_port(port);
    }
    if let Ok(domain) = env::var("SOFTPHONE_DOMAIN") {
        config = config.with_domain(domain);
    }
    if let Ok(uri) = env::var("SOFTPHONE_WS_URI") {
        config = config.with_ws_uri(uri);
    }
    if let Ok(stun) = env::var("SOFTPHONE_STUN") {
        config = config.with_stun_server(stun);
    }
    Ok(config)
}

fn settings_from_env() -> anyhow::Result<SoftphoneSettings> {
    let mut settings =
        SoftphoneSettings::new(env::var("SOFTPHONE_USER").unwrap_or_else(|_| "local".to_string()));
    if let Ok(secs) = env::var("SOFTPHONE_GUARD_SECS") {
        let secs: u64 = secs
            .parse()
            .with_context(|| format!("SOFTPHONE_GUARD_SECS is not a number: {:?}", secs))?;
        settings = settings.with_guard_window(Duration::from_secs(secs));
    }
    Ok(settings)
}

fn show(notification: Notification) {
    match notification.level {
        NotificationLevel::Info => println!("[info] {}", notification.message),
        NotificationLevel::Warning => println!("[warn] {}", notification.message),
        NotificationLevel::Error => println!("[error] {}", notification.message),
    }
}

async fn dispatch(handle: &SoftphoneHandle, line: &str) -> anyhow::Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };
    let arg = parts.next();

    let result = match (command, arg) {
        ("call", Some(target)) => handle.make_call(target).await,
        ("answer", _) => handle.answer().await,
        ("hangup", _) => handle.hangup().await,
        ("mute", _) => handle.toggle_mute().await.map(|muted| {
            println!("muted: {}", muted);
        }),
        ("hold", _) => handle.toggle_hold().await.map(|held| {
            println!("on hold: {}", held);
        }),
        ("dtmf", Some(digits)) => {
            let mut result = Ok(());
            for digit in digits.chars() {
                result = handle.send_dtmf(digit).await;
                if result.is_err() {
                    break;
                }
            }
            result
        }
        ("audio", _) => handle.play_remote_audio().await,
        ("status", Some(status)) => match status.parse::<PresenceStatus>() {
            Ok(status) => handle.change_status(status).await,
            Err(e) => Err(e),
        },
        ("reconnect", _) => handle.force_reconnect().await.map(|outcome| {
            println!("reconnect: {:?}", outcome);
        }),
        ("reload", _) => handle.reload_config().await,
        ("state", _) => {
            println!("{:#?}", handle.state());
            Ok(())
        }
        ("quit", _) | ("exit", _) => return Ok(false),
        _ => {
            println!("{}", HELP);
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("{} failed: {}", command, e);
        println!("error: {}", e);
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    info!("Starting softphone");

    let settings = settings_from_env()?;
    let store = Arc::new(MemoryStore::new());
    store
        .save_config(&settings.user_id, &account_from_env()?)
        .await
        .context("storing SIP account")?;

    let engine = Arc::new(LoopbackEngine::auto());
    let (orchestrator, mut notifications) =
        SessionOrchestrator::new(settings, engine, store.clone(), store);
    let (handle, task) = orchestrator.spawn();

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => show(notification),
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !dispatch(&handle, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if let Err(e) = handle.shutdown() {
        error!("Orchestrator already stopped: {}", e);
    }
    task.await.context("orchestrator task panicked")?;
    info!("Softphone stopped");
    Ok(())
}
