use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ConversationView, Credentials, MessageGroup, SessionEvent, StaticAuthProvider,
    SyncClient,
};
use shared::domain::{Direction, Message, MessageId, ParticipantId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Terminal direct-message client. Lines typed are sent to `--peer`; lines
/// starting with `/` are commands (`/help` lists them).
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    relay_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long, env = "CHAT_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long)]
    peer: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(relay_url) = args.relay_url {
        settings.relay_url = relay_url;
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }

    let auth = Arc::new(StaticAuthProvider::new(Some(Credentials::new(
        args.username,
        args.password,
    ))));
    let client = SyncClient::open(&settings, auth)
        .await
        .context("failed to start client")?;

    let mut session_events = client.session.events();
    tokio::spawn(async move {
        while let Ok(event) = session_events.recv().await {
            match event {
                SessionEvent::Authenticated(identity) => println!("* signed in as {identity}"),
                SessionEvent::RegistrationRejected(reason) => println!("* sign-in rejected: {reason}"),
                SessionEvent::SignedOut => println!("* signed out"),
            }
        }
    });

    let me = match client.connect_and_sign_in().await {
        Ok(identity) => identity,
        Err(err) => {
            client.shutdown();
            return Err(err);
        }
    };
    let peer = ParticipantId::new(args.peer);

    let mut view = client.engine.view(&peer).await?;
    tokio::spawn(async move {
        let mut shown = 0;
        while let Some(snapshot) = view.next().await {
            for message in snapshot.messages.iter().skip(shown) {
                print_message(message);
            }
            shown = snapshot.messages.len();
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            if !run_command(&client, &me, &peer, command).await {
                break;
            }
            continue;
        }
        match client.engine.send(&peer, line).await {
            Ok(receipt) if receipt.message.is_pending_delivery() => {
                println!("* queued #{} until the relay is reachable", receipt.message.id.0)
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "send failed"),
        }
    }

    client.shutdown();
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn run_command(client: &SyncClient, me: &ParticipantId, peer: &ParticipantId, command: &str) -> bool {
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let result: Result<()> = async {
        match name {
            "quit" | "exit" => return Ok(()),
            "help" => println!(
                "/label <id> [text]  /filter <text>  /links  /domains  /labels  /search [text]  /partners  /quit"
            ),
            "label" => {
                let (id, label) = rest.split_once(' ').unwrap_or((rest, ""));
                let id: i64 = id.trim().parse().context("usage: /label <id> [text]")?;
                let updated = client
                    .engine
                    .update_label(MessageId(id), Some(label.trim()))
                    .await?;
                println!("* #{} label: {}", updated.id.0, updated.label.as_deref().unwrap_or("-"));
            }
            "filter" => conversation(client, peer).await?.filter(rest).iter().for_each(print_message),
            "links" => conversation(client, peer).await?.links().iter().for_each(print_message),
            "domains" => print_groups(&conversation(client, peer).await?.group_by_domain()),
            "labels" => print_groups(&conversation(client, peer).await?.group_by_label()),
            "search" => {
                for found in client.engine.search_peers(rest).await? {
                    if &found != me {
                        println!("  {found}");
                    }
                }
            }
            "partners" => {
                for partner in client.engine.conversation_partners().await? {
                    println!("  {partner}");
                }
            }
            other => println!("* unknown command /{other}, try /help"),
        }
        Ok(())
    }
    .await;
    if let Err(err) = result {
        println!("* {err:#}");
    }
    !matches!(name, "quit" | "exit")
}

async fn conversation(client: &SyncClient, peer: &ParticipantId) -> Result<ConversationView> {
    Ok(ConversationView::new(client.engine.conversation(peer).await?))
}

fn print_groups(groups: &[MessageGroup]) {
    for group in groups {
        println!("[{}]", group.name);
        group.messages.iter().for_each(print_message);
    }
}

fn print_message(message: &Message) {
    let arrow = match message.direction {
        Direction::Outbound => "->",
        Direction::Inbound => "<-",
    };
    let pending = if message.is_pending_delivery() { " (pending)" } else { "" };
    let label = message
        .label
        .as_deref()
        .map(|label| format!(" [{label}]"))
        .unwrap_or_default();
    println!(
        "#{} {arrow} {}: {}{label}{pending}",
        message.id.0, message.sender, message.content
    );
}
