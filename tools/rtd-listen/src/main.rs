// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rtd-listen - print messages arriving on an MQTT topic
//!
//! Companion to `rtd-logger` for checking what reaches an IoT broker.
//!
//! # Usage
//!
//! ```bash
//! rtd-listen --host xxxx-ats.iot.ap-south-1.amazonaws.com \
//!     --ca AmazonRootCA1.pem --cert device.pem.crt --key private.pem.key
//! ```

mod listener;

use anyhow::{Context, Result};
use clap::Parser;
use listener::{ListenError, Message, MessageSource};
use rtd_logger::shutdown::spawn_signal_listener;
use rtd_logger::StopHandle;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

/// Subscribe to an MQTT topic and print every message
#[derive(Parser, Debug)]
#[command(name = "rtd-listen")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Subscribe to an MQTT topic over mutual TLS and print every message")]
struct Args {
    /// Broker host name
    #[arg(long, env = "MQTT_HOST")]
    host: String,

    /// Broker port
    #[arg(short, long, env = "MQTT_PORT", default_value = "8883")]
    port: u16,

    /// MQTT client identifier
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "rtd-listen")]
    client_id: String,

    /// Topic to subscribe to
    #[arg(short, long, env = "MQTT_TOPIC", default_value = "test/helloOrange")]
    topic: String,

    /// Root CA certificate (PEM); enables TLS
    #[arg(long, env = "MQTT_CA")]
    ca: Option<PathBuf>,

    /// Client certificate (PEM) for mutual TLS
    #[arg(long, env = "MQTT_CERT", requires = "ca", requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key (PEM) for mutual TLS
    #[arg(long, env = "MQTT_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// Keep-alive interval (seconds)
    #[arg(long, default_value = "30")]
    keep_alive: u64,

    /// Start a clean session instead of resuming the broker-side one
    #[arg(long)]
    clean_session: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttSource {
    fn new(args: &Args) -> Result<Self> {
        let mut options = MqttOptions::new(&args.client_id, &args.host, args.port);
        options.set_keep_alive(Duration::from_secs(args.keep_alive));
        options.set_clean_session(args.clean_session);

        if let Some(ca_path) = &args.ca {
            let ca = read_pem(ca_path)?;
            let client_auth = match (&args.cert, &args.key) {
                (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
                _ => None,
            };
            options.set_transport(Transport::tls(ca, client_auth, None));
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        Ok(Self { client, eventloop })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

impl MessageSource for MqttSource {
    async fn subscribe(&mut self, topic: &str) -> Result<(), ListenError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ListenError::Connect(e.to_string()))?;

        let mut connected = false;
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ListenError::Connect(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    connected = true;
                    tracing::info!(session_present = ack.session_present, "Connected");
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure))
                    {
                        return Err(ListenError::Subscribe {
                            topic: topic.to_string(),
                            reason: "broker returned failure".into(),
                        });
                    }
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if connected => return Err(ListenError::Connection(e.to_string())),
                Err(e) => return Err(ListenError::Connect(e.to_string())),
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<Message>, ListenError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    return Ok(Some(Message {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    }));
                }
                Ok(_) => {}
                Err(e) => return Err(ListenError::Connection(e.to_string())),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!(error = %e, "Failed to queue disconnect");
            return;
        }
        // Drive the event loop until the DISCONNECT packet is on the wire.
        let flushed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::warn!("Timed out sending disconnect");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match listen(&args).await {
        Ok(received) => {
            tracing::info!(received, "Disconnected");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Listener failed");
            ExitCode::FAILURE
        }
    }
}

async fn listen(args: &Args) -> Result<u64> {
    tracing::info!(host = %args.host, port = args.port, "Connecting");
    let mut source = MqttSource::new(args)?;

    let stop = StopHandle::new();
    let signals = spawn_signal_listener(stop.clone());

    let mut out = std::io::stdout();
    let outcome = listener::run(&mut source, &args.topic, &mut out, &stop).await;
    signals.abort();
    Ok(outcome?)
}
