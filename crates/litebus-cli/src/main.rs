use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use litebus::{ChannelKey, MessageBus, Settings, WsTransport};

#[derive(Parser, Debug)]
#[command(name = "litebus", version, about = "Talk to a litebus hub")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the `transport` settings section
#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Hub URL (e.g., ws://localhost:6001/app)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Application key presented to the hub
    #[arg(long, global = true)]
    app_key: Option<String>,

    /// Bearer token
    #[arg(long, global = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print messages published on a channel
    Tail {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        event: String,
        /// Exit after this many messages
        #[arg(long)]
        count: Option<usize>,
    },

    /// Publish one JSON message
    Send {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        event: String,
        /// Message payload as JSON
        #[arg(long)]
        data: String,
    },

    /// Delete the current message of each channel (given as channel:event)
    Clear {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

fn parse_key(raw: &str) -> anyhow::Result<ChannelKey> {
    match raw.split_once(':') {
        Some((channel, event)) if !channel.is_empty() && !event.is_empty() => {
            Ok(ChannelKey::new(channel, event))
        }
        _ => bail!("invalid channel key '{}', expected channel:event", raw),
    }
}

fn load_settings(args: ConnectionArgs) -> anyhow::Result<Settings> {
    let mut settings = Settings::new().context("failed to load settings")?;

    if let Some(url) = args.url {
        settings.transport.url = Some(url);
    }
    if let Some(app_key) = args.app_key {
        settings.transport.app_key = app_key;
    }
    if let Some(token) = args.token {
        settings.transport.token = Some(token);
    }

    if settings.transport.url.is_none() {
        bail!("hub url not configured (use --url or LITEBUS_TRANSPORT__URL)");
    }
    Ok(settings)
}

async fn tail(bus: &MessageBus, channel: &str, event: &str, count: Option<usize>) -> anyhow::Result<()> {
    let mut messages = bus.hook::<Value>(channel, event).await?;
    tracing::info!(channel = %channel, event = %event, "tailing channel");

    let mut seen = 0;
    loop {
        tokio::select! {
            message = messages.next() => {
                let Some(message) = message else { break };
                match message {
                    Ok(value) => println!("{}", value),
                    Err(e) => tracing::warn!(error = %e, "skipping message"),
                }
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.connection)?;

    tracing::info!(
        url = ?settings.transport.url,
        app_key = %settings.transport.app_key,
        "litebus starting"
    );

    let transport = WsTransport::new(settings.transport.clone());
    let bus = MessageBus::from_settings(Arc::new(transport.clone()), &settings.bus);

    let result = match cli.command {
        Command::Tail {
            channel,
            event,
            count,
        } => tail(&bus, &channel, &event, count).await,
        Command::Send {
            channel,
            event,
            data,
        } => {
            let data: Value = serde_json::from_str(&data).context("--data must be valid JSON")?;
            bus.send(&channel, &event, &data).await?;
            tracing::info!(channel = %channel, event = %event, "message sent");
            Ok(())
        }
        Command::Clear { keys } => {
            for raw in &keys {
                let key = parse_key(raw)?;
                bus.add_channel(&key.channel_name, &key.event_name).await?;
            }
            bus.delete_messages().await?;
            tracing::info!(channels = keys.len(), "channels cleared");
            Ok(())
        }
    };

    bus.shutdown();
    transport.disconnect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        let key = parse_key("ui:msg").unwrap();
        assert_eq!(key, ChannelKey::new("ui", "msg"));

        assert!(parse_key("ui").is_err());
        assert!(parse_key("ui:").is_err());
        assert!(parse_key(":msg").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "litebus",
            "--url",
            "ws://localhost:6001/app",
            "send",
            "--channel",
            "ui",
            "--event",
            "msg",
            "--data",
            "{\"id\":1}",
        ])
        .unwrap();

        assert_eq!(cli.connection.url.as_deref(), Some("ws://localhost:6001/app"));
        assert!(matches!(cli.command, Command::Send { ref channel, .. } if channel == "ui"));
    }

    #[test]
    fn test_clear_requires_keys() {
        assert!(Cli::try_parse_from(["litebus", "clear"]).is_err());
    }
}
