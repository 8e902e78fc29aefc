use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ConversationKey, MessageId, ParticipantId};
use storage::MessageStore;

/// Offline inspection of a local message database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/messages.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Peers of `owner`, most recently active first.
    Partners { owner: String },
    /// One conversation as JSON lines, oldest first.
    Dump { owner: String, peer: String },
    /// Outbound messages of `owner` still waiting for the relay.
    Pending { owner: String },
    /// Sets a label; omit `label` to clear it.
    Label { id: i64, label: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = MessageStore::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open '{}'", cli.database_url))?;

    match cli.command {
        Command::Partners { owner } => {
            for peer in store.conversation_partners(&ParticipantId::new(owner)).await? {
                println!("{peer}");
            }
        }
        Command::Dump { owner, peer } => {
            let key = ConversationKey::new(ParticipantId::new(owner), ParticipantId::new(peer));
            for message in store.query(&key).await? {
                println!("{}", serde_json::to_string(&message)?);
            }
        }
        Command::Pending { owner } => {
            for message in store.pending_outbound(&ParticipantId::new(owner)).await? {
                println!("{}", serde_json::to_string(&message)?);
            }
        }
        Command::Label { id, label } => {
            let updated = store.update_label(MessageId(id), label.as_deref()).await?;
            println!(
                "message {} label={}",
                updated.id.0,
                updated.label.as_deref().unwrap_or("<none>")
            );
        }
    }

    Ok(())
}
