mod client;
mod offset;

use std::time::Duration;

use pulse_domain::config::{ChatPollConfig, LogConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::{ChatClient, PulseApiClient};
use crate::offset::OffsetStore;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = LogConfig::from_env();
    let filter = EnvFilter::try_new(&log_config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ChatPollConfig::from_env()?;
    let chat = ChatClient::new(chat_base_url(), config.chat_api_token.clone())?;
    let pulse_api = PulseApiClient::new(config.pulse_api_url.clone(), config.pulse_api_token.clone())?;
    let offsets = OffsetStore::new(config.offset_path.clone());

    let mut offset = offsets.load();
    let mut backoff = Duration::from_secs(1);

    loop {
        let shutdown = tokio::select! {
            _ = drain_poll(&chat, &pulse_api, &offsets, &config.chat_authorized_peer, &mut offset, &mut backoff) => false,
            _ = signal_received() => true,
        };
        if shutdown {
            info!("shutdown signal received, draining current poll and exiting");
            break;
        }
    }

    Ok(())
}

/// Chat provider endpoints are typically rooted at a fixed origin
/// (overridable for test doubles); this process only ever needs one poll
/// endpoint configured through the environment.
fn chat_base_url() -> String {
    std::env::var("CHAT_API_BASE_URL").unwrap_or_else(|_| "https://api.telegram.org".to_string())
}

async fn drain_poll(
    chat: &ChatClient,
    pulse_api: &PulseApiClient,
    offsets: &OffsetStore,
    authorized_peer: &str,
    offset: &mut u64,
    backoff: &mut Duration,
) {
    match chat.get_updates(*offset).await {
        Ok(updates) => {
            *backoff = Duration::from_secs(1);
            for update in updates {
                if update.peer_id != authorized_peer {
                    debug_skip(&update.peer_id);
                    *offset = update.update_id + 1;
                    continue;
                }

                let prompt = format!("chat message from {}: {}", update.user, update.text);
                let result = pulse_api
                    .schedule_pulse(&prompt, "critical", "chat", &["chat", "user_message"])
                    .await;

                match result {
                    Ok(()) => {
                        info!(peer_id = %update.peer_id, "translated chat message into a pulse");
                        *offset = update.update_id + 1;
                    }
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "fatal error scheduling pulse, exiting");
                        std::process::exit(1);
                    }
                    Err(e) => {
                        // Don't advance past this update: a transient failure
                        // must leave it unconsumed so the next poll re-fetches
                        // and retries it, per the retry-on-transient-failure
                        // requirement. Stop the batch here to preserve order.
                        warn!(error = %e, "transient error scheduling pulse, will retry next cycle");
                        break;
                    }
                }
            }

            if let Err(e) = offsets.save(*offset) {
                warn!(error = %e, "failed to persist offset");
            }
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "fatal error polling chat provider, exiting");
            std::process::exit(1);
        }
        Err(e) => {
            warn!(error = %e, backoff = ?*backoff, "transient error polling chat provider, backing off");
            tokio::time::sleep(*backoff).await;
            *backoff = (*backoff * 2).min(MAX_BACKOFF);
        }
    }
}

fn debug_skip(peer_id: &str) {
    tracing::debug!(peer_id, "ignoring message from unauthorized peer");
}

async fn signal_received() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
