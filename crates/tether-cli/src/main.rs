//! # tether
//!
//! Command-line driver for the tether sync core. Connects with the
//! configuration found in `TETHER_*` environment variables, loads the first
//! page of the user's channels and tails realtime activity to the log.
//!
//! ```text
//! tether                      # tail everything
//! tether messaging:general    # also load and watch one channel
//! tether messaging:general hi # ... and send a message to it
//! ```

use anyhow::{bail, Context};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_client::{ChatClient, ChatClientConfig, DomainEvent};
use tether_shared::api::ChannelListQuery;
use tether_shared::{ChannelId, Filter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tether_client=debug,tether_net=debug")
        }))
        .init();

    info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ChatClientConfig::from_env();
    if config.api_key.is_empty() || config.user_id.as_str().is_empty() {
        bail!("TETHER_API_KEY and TETHER_USER_ID must be set");
    }
    info!(
        user = %config.user_id,
        base_url = %config.base_url,
        ws_url = %config.ws_url,
        automatic_filtering = config.is_channel_automatic_filtering_enabled,
        "Loaded configuration"
    );

    let mut args = std::env::args().skip(1);
    let channel: Option<ChannelId> = match args.next() {
        Some(raw) => Some(
            raw.parse::<ChannelId>()
                .map_err(anyhow::Error::msg)
                .context("first argument must be a channel id `type:id`")?,
        ),
        None => None,
    };
    let text: Option<String> = {
        let rest: Vec<String> = args.collect();
        (!rest.is_empty()).then(|| rest.join(" "))
    };

    // -----------------------------------------------------------------------
    // 3. Start the client
    // -----------------------------------------------------------------------
    let client = ChatClient::new(config.clone())?;
    let mut events = client.subscribe_events();
    let mut connection = client.subscribe_connection_state();

    let resumed = client.resume_pending_messages()?;
    if resumed > 0 {
        info!(resumed, "Resumed unsent messages");
    }
    client.connect();

    let list = client.channel_list(ChannelListQuery::new(Filter::ContainsMember(
        config.user_id.clone(),
    )));
    match list.load_next_channels().await {
        Ok(count) => info!(count, "Loaded channels"),
        Err(e) => warn!(error = %e, "Failed to load channels"),
    }
    for channel in list.channels()? {
        info!(cid = %channel.cid, name = ?channel.name, "Channel");
    }

    if let Some(cid) = &channel {
        client.watch_channel(cid).await?;
        let loader = client.channel_loader(cid.clone());
        loader.load_first_page().await?;
        for message in client.store().channel_messages(cid)? {
            info!(cid = %cid, author = %message.author, text = %message.text, "Message");
        }

        if let Some(text) = text {
            let pending = client.send_message(cid, text, None, Vec::new()).await?;
            match pending.confirmed().await {
                Ok(message) => info!(id = %message.id, "Message sent"),
                Err(e) => warn!(error = %e, "Message failed"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // 4. Tail until Ctrl-C
    // -----------------------------------------------------------------------
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }

            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                info!(state = ?state, "Connection");
            }

            event = events.recv() => {
                match event {
                    Ok(DomainEvent::MessageNew { cid, message_id, .. }) => {
                        if let Ok(Some(message)) = client.store().message(&message_id) {
                            info!(cid = %cid, author = %message.author, text = %message.text, "New message");
                        }
                    }
                    Ok(event) => info!(cid = %event.cid(), event = ?event, "Event"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    client.disconnect();
    client.shutdown();
    Ok(())
}
