use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, MembershipState, Role, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    CreateGroup {
        owner_user_id: i64,
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Members added directly as accepted members.
        #[arg(long = "member", value_delimiter = ',')]
        members: Vec<i64>,
    },
    AddMember {
        conversation_id: i64,
        user_id: i64,
        #[arg(long, default_value = "member")]
        role: String,
    },
    DisableUser {
        user_id: i64,
    },
    EnableUser {
        user_id: i64,
    },
    ListConversations {
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::CreateUser {
            username,
            display_name,
        } => {
            if storage.find_user_by_username(&username).await?.is_some() {
                bail!("username {username} is taken");
            }
            let display_name = display_name.unwrap_or_else(|| username.clone());
            let user_id = storage.create_user(&username, &display_name).await?;
            println!("created user_id={}", user_id.0);
        }
        Command::CreateGroup {
            owner_user_id,
            name,
            description,
            members,
        } => {
            let conversation_id = storage
                .create_group_conversation(
                    UserId(owner_user_id),
                    &name,
                    description.as_deref(),
                    &[],
                    Utc::now(),
                )
                .await?;
            for member in members.into_iter().filter(|id| *id != owner_user_id) {
                storage
                    .add_membership(
                        conversation_id,
                        UserId(member),
                        Role::Member,
                        MembershipState::Accepted,
                    )
                    .await?;
            }
            println!("created conversation_id={}", conversation_id.0);
        }
        Command::AddMember {
            conversation_id,
            user_id,
            role,
        } => {
            let role = match role.to_ascii_lowercase().as_str() {
                "member" => Role::Member,
                "admin" => Role::Admin,
                other => bail!("unsupported role {other}; use member or admin"),
            };
            storage
                .add_membership(
                    ConversationId(conversation_id),
                    UserId(user_id),
                    role,
                    MembershipState::Accepted,
                )
                .await?;
            println!("added user_id={user_id} to conversation_id={conversation_id}");
        }
        Command::DisableUser { user_id } => {
            if !storage.set_user_disabled(UserId(user_id), true).await? {
                bail!("no user with id {user_id}");
            }
            println!("disabled user_id={user_id}");
        }
        Command::EnableUser { user_id } => {
            if !storage.set_user_disabled(UserId(user_id), false).await? {
                bail!("no user with id {user_id}");
            }
            println!("enabled user_id={user_id}");
        }
        Command::ListConversations { user_id } => {
            for entry in storage.list_conversations(UserId(user_id)).await? {
                println!(
                    "{}\t{}\t{}\tunread={}",
                    entry.conversation.conversation_id.0,
                    entry.conversation.kind.as_str(),
                    entry.conversation.last_activity_at,
                    entry.unread_count
                );
            }
        }
    }

    Ok(())
}
