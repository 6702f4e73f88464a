mod logging;

use std::{env, sync::Arc, time::Duration};

use messaging_core::{ContactCenterEvent, PollerEvent};
use messaging_http::{HttpGateway, MessagingConfig, spawn_poller_with_lifecycle};
use messaging_platform::{LifecycleState, ManualLifecycle, ReachabilityProbe};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    logging::init();

    let chat_ids: Vec<String> = env::args().skip(1).collect();
    if chat_ids.is_empty() {
        eprintln!("usage: messaging-smoke <chat-id>...");
        eprintln!(
            "Required env: MESSAGING_BASE_URL, MESSAGING_TENANT_URL, MESSAGING_APP_ID, MESSAGING_CLIENT_ID"
        );
        std::process::exit(2);
    }

    let config = match MessagingConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let gateway = match HttpGateway::new(config.gateway.clone()) {
        Ok(gateway) => Arc::new(gateway),
        Err(err) => {
            eprintln!("Failed to build HTTP gateway: {err}");
            std::process::exit(1);
        }
    };

    let lifecycle = ManualLifecycle::new(LifecycleState::default());
    let stop = CancellationToken::new();
    let probe = config.gateway.reachability_target().map(|target| {
        ReachabilityProbe::new(target)
            .with_interval(Duration::from_secs(10))
            .spawn(lifecycle.clone(), stop.clone())
    });

    let handle = spawn_poller_with_lifecycle(gateway, config.poller, &lifecycle);
    let mut events = handle.subscribe();
    for chat_id in &chat_ids {
        if let Err(err) = handle.register(chat_id.as_str()) {
            error!(chat_id = %chat_id, error = %err, "failed to register chat");
        }
    }
    info!(sessions = chat_ids.len(), "polling started; press ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(PollerEvent::Delivery(delivery)) => match delivery.result {
                    Ok(batch) => {
                        for event in batch {
                            print_event(&delivery.chat_id, &event);
                        }
                    }
                    Err(err) => warn!(chat_id = %delivery.chat_id, code = err.code(), error = %err, "poll failed"),
                },
                Ok(PollerEvent::SessionRemoved { chat_id, reason }) => {
                    info!(chat_id = %chat_id, ?reason, "session removed");
                    if handle.snapshot().is_empty() {
                        break;
                    }
                }
                Ok(PollerEvent::PhaseChanged { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let _ = handle.shutdown();
    stop.cancel();
    if let Some(probe) = probe {
        let _ = probe.await;
    }
}

fn print_event(chat_id: &str, event: &ContactCenterEvent) {
    match event {
        ContactCenterEvent::MessageReceived {
            party_id, message, ..
        } => println!(
            "[{chat_id}] {}: {message}",
            party_id.as_deref().unwrap_or("?")
        ),
        other => println!("[{chat_id}] {}", other.kind().as_wire()),
    }
}
