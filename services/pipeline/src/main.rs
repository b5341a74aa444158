//! friendlink-publish - publish friend link events by hand
//!
//! Useful for replaying a link creation or generating clicks against a running
//! streams service:
//!
//! ```text
//! friendlink-publish upload <friend-code> <storage-key> [ttl-minutes]
//! friendlink-publish click <friend-code>
//! ```

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use friendlink_pipeline::{ClickEvent, EventProducer, KafkaConfig, UploadEvent};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Links issued by the link service live for one hour
const DEFAULT_TTL_MINUTES: i64 = 60;

#[derive(Debug, PartialEq)]
enum Command {
    Upload {
        friend_code: String,
        storage_key: String,
        ttl_minutes: i64,
    },
    Click {
        friend_code: String,
    },
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [mode, friend_code, storage_key, rest @ ..] if mode == "upload" && rest.len() <= 1 => {
            let ttl_minutes = match rest.first() {
                Some(ttl) => ttl
                    .parse()
                    .with_context(|| format!("Invalid ttl-minutes: {}", ttl))?,
                None => DEFAULT_TTL_MINUTES,
            };
            Ok(Command::Upload {
                friend_code: friend_code.clone(),
                storage_key: storage_key.clone(),
                ttl_minutes,
            })
        }
        [mode, friend_code] if mode == "click" => Ok(Command::Click {
            friend_code: friend_code.clone(),
        }),
        _ => bail!("unrecognized arguments"),
    }
}

fn print_usage() {
    println!("Usage:");
    println!("  friendlink-publish upload <friend-code> <storage-key> [ttl-minutes]");
    println!("  friendlink-publish click <friend-code>");
    println!();
    println!("Environment variables:");
    println!("  KAFKA_BOOTSTRAP_SERVERS - Kafka broker addresses (default: localhost:9092)");
    println!("  KAFKA_UPLOAD_TOPIC      - Upload topic (default: friend-file-upload-events)");
    println!("  KAFKA_CLICK_TOPIC       - Click topic (default: friend-click-events)");
    println!("  KAFKA_SECURITY_PROTOCOL - Security protocol (plaintext, ssl, sasl_plaintext, sasl_ssl)");
    println!("  KAFKA_SASL_USERNAME     - SASL username");
    println!("  KAFKA_SASL_PASSWORD     - SASL password");
    println!("  KAFKA_SSL_CA_LOCATION   - CA bundle for broker certificates");
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(_) => {
            print_usage();
            return Ok(());
        }
    };

    let config = KafkaConfig::from_env()?;
    config.validate()?;
    let producer = EventProducer::new(config)?;

    let now = Utc::now();
    let delivery = match command {
        Command::Upload {
            friend_code,
            storage_key,
            ttl_minutes,
        } => {
            let expires_at = now + Duration::minutes(ttl_minutes);
            let event = UploadEvent::new(
                friend_code,
                storage_key,
                now.timestamp_millis(),
                expires_at.timestamp_millis(),
            );
            producer
                .publish_upload_event(&event)
                .await
                .context("Failed to publish upload event")?
        }
        Command::Click { friend_code } => {
            let event = ClickEvent::new(friend_code, now.timestamp_millis());
            producer
                .publish_click_event(&event)
                .await
                .context("Failed to publish click event")?
        }
    };

    info!(
        "Published to {} partition {} offset {}",
        delivery.topic, delivery.partition, delivery.offset
    );

    Ok(())
}
