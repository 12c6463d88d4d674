//! Tandem demo binary.
//!
//! # Usage
//!
//! ```bash
//! # First contact with a provisional message, then a resumption
//! tandem-demo --initiator alice --responder bob --message "hello bob"
//!
//! # Show every state transition
//! tandem-demo --log-level debug
//! ```

use std::time::Duration;

use clap::Parser;
use tandem_core::{HandshakeConfig, MemoryDirectory};
use tandem_demo::{Link, Peer, ReadAloud, converse};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Two in-process parties running a first-contact and a resumption handshake
#[derive(Parser, Debug)]
#[command(name = "tandem-demo")]
#[command(about = "Tandem handshake demo")]
#[command(version)]
struct Args {
    /// Initiator identity
    #[arg(long, default_value = "alice")]
    initiator: String,

    /// Responder identity
    #[arg(long, default_value = "bob")]
    responder: String,

    /// Provisional first message sent with the first handshake
    #[arg(short, long)]
    message: Option<String>,

    /// Application messages exchanged per session
    #[arg(long, default_value = "3")]
    rounds: u32,

    /// Handshake timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Skip SAS confirmation on first contact
    #[arg(long)]
    no_sas: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = HandshakeConfig {
        timeout: Duration::from_secs(args.timeout),
        require_sas_in_first_contact: !args.no_sas,
    };
    let directory = MemoryDirectory::new();
    let initiator = Peer::new(args.initiator.as_str().into(), config.clone());
    let mut responder = Peer::new(args.responder.as_str().into(), config);
    responder.publish(&directory);

    let (mut initiator_link, mut responder_link) = Link::pair(16);

    for (round, first_message) in [args.message.as_deref(), None].into_iter().enumerate() {
        tracing::info!(round, "starting handshake");

        let (a, b) = tokio::join!(
            initiator.initiate(
                responder.identity().clone(),
                &directory,
                first_message.map(str::as_bytes),
                &mut initiator_link,
            ),
            responder.respond(&mut responder_link),
        );
        let (mut a, mut b) = (a?, b?);

        if let Some(message) = &b.delivered {
            tracing::info!(message = %String::from_utf8_lossy(message), "responder received");
        }

        // Each user reads their code aloud to the other
        let (heard_by_initiator, heard_by_responder) = (b.session.sas(), a.session.sas());
        let a_status = a.session.confirm_sas(&mut ReadAloud::heard(heard_by_initiator));
        let b_status = b.session.confirm_sas(&mut ReadAloud::heard(heard_by_responder));
        tracing::info!(mode = ?a.session.mode(), ?a_status, ?b_status, "verification");

        let received = converse(
            &mut a.session,
            &mut initiator_link,
            &mut b.session,
            &mut responder_link,
            args.rounds,
        )
        .await?;
        tracing::info!(messages = received.len(), "conversation finished");
    }

    tracing::info!(cached = initiator.store().len(), "done");
    Ok(())
}
