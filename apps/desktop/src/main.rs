use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{ClientEvent, ClientHandle, RealtimeClient};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::CreateConversationRequest,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    List,
    Pending,
    Open(ConversationId),
    Older,
    Accept(ConversationId),
    Reject(ConversationId),
    Direct(UserId),
    Group { name: String, members: Vec<UserId> },
    Status(String),
    Read,
    Quit,
    Say(String),
}

fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Say(line.to_string())));
    };
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let id = |raw: Option<&str>| {
        raw.and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| format!("/{name} needs a numeric id"))
    };
    let input = match name {
        "list" => Input::List,
        "pending" => Input::Pending,
        "open" => Input::Open(ConversationId(id(parts.next())?)),
        "older" => Input::Older,
        "accept" => Input::Accept(ConversationId(id(parts.next())?)),
        "reject" => Input::Reject(ConversationId(id(parts.next())?)),
        "dm" => Input::Direct(UserId(id(parts.next())?)),
        "group" => {
            let name = parts
                .next()
                .ok_or_else(|| "/group needs a name".to_string())?
                .to_string();
            let members = parts
                .flat_map(|raw| raw.split(','))
                .filter(|raw| !raw.is_empty())
                .map(|raw| {
                    raw.parse::<i64>()
                        .map(UserId)
                        .map_err(|_| format!("invalid member id {raw}"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Input::Group { name, members }
        }
        "status" => Input::Status(
            parts
                .next()
                .ok_or_else(|| "/status needs online, away, busy or invisible".to_string())?
                .to_string(),
        ),
        "read" => Input::Read,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command /{other}")),
    };
    Ok(Some(input))
}

async fn print_conversations(client: &Arc<RealtimeClient>, pending: bool) {
    let lines: Vec<String> = client
        .snapshot(|state| {
            let entries = if pending {
                state.pending_invitations()
            } else {
                state.conversations().entries()
            };
            entries
                .iter()
                .map(|entry| {
                    format!(
                        "[{}] {} ({}) unread={}",
                        entry.conversation_id,
                        entry.title,
                        entry.kind.as_str(),
                        entry.unread_count
                    )
                })
                .collect()
        })
        .await;
    if lines.is_empty() {
        println!("(none)");
    }
    for line in lines {
        println!("{line}");
    }
}

/// Prints timeline additions and other pushes as they arrive.
async fn print_events(client: Arc<RealtimeClient>) {
    let mut events = client.subscribe_events();
    let mut printed: HashMap<ConversationId, MessageId> = HashMap::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
                continue;
            }
            Err(_) => break,
        };
        match event {
            ClientEvent::TimelineUpdated { conversation_id } => {
                let last = printed.get(&conversation_id).copied().unwrap_or(MessageId(0));
                let fresh: Vec<(MessageId, String)> = client
                    .snapshot(|state| {
                        state
                            .open_timeline()
                            .filter(|timeline| timeline.conversation_id() == conversation_id)
                            .map(|timeline| {
                                timeline
                                    .messages()
                                    .iter()
                                    .filter(|m| m.message_id > last)
                                    .map(|m| {
                                        let who = m
                                            .sender_name
                                            .clone()
                                            .unwrap_or_else(|| m.sender_id.to_string());
                                        (m.message_id, format!("{} {who}: {}", m.sent_at.format("%H:%M"), m.content))
                                    })
                                    .collect()
                            })
                            .unwrap_or_default()
                    })
                    .await;
                for (message_id, line) in fresh {
                    printed.insert(conversation_id, message_id);
                    println!("{line}");
                }
            }
            ClientEvent::TypingUpdated {
                conversation_id,
                user_ids,
            } if !user_ids.is_empty() => {
                println!("[{conversation_id}] typing: {user_ids:?}");
            }
            ClientEvent::PresenceUpdated { user_id, status } => {
                println!("user {user_id} is {}", status.as_str());
            }
            ClientEvent::ConversationsStale => {
                if let Err(err) = client.refresh_conversations().await {
                    warn!(error = %err, "failed to reload conversations");
                }
            }
            ClientEvent::ConversationRemoved { conversation_id } => {
                println!("conversation {conversation_id} was removed");
            }
            ClientEvent::Error(error) => println!("error: {}", error.message),
            ClientEvent::Disconnected => {
                println!("disconnected from server");
                break;
            }
            _ => {}
        }
    }
}

async fn run_input(client: &Arc<RealtimeClient>, input: Input) -> Result<bool> {
    match input {
        Input::List => print_conversations(client, false).await,
        Input::Pending => print_conversations(client, true).await,
        Input::Open(conversation_id) => client.open_conversation(conversation_id).await?,
        Input::Older => {
            if !client.load_older().await? {
                println!("no older messages");
            }
        }
        Input::Accept(conversation_id) => client.accept_conversation(conversation_id).await?,
        Input::Reject(conversation_id) => client.reject_conversation(conversation_id).await?,
        Input::Direct(user_id) => {
            let summary = client
                .create_conversation(CreateConversationRequest::Private { user_id })
                .await?;
            println!("conversation {} with {}", summary.conversation_id, summary.title);
        }
        Input::Group { name, members } => {
            let summary = client
                .create_conversation(CreateConversationRequest::Group {
                    name,
                    description: None,
                    member_ids: members,
                })
                .await?;
            println!("created group {}", summary.conversation_id);
        }
        Input::Status(status) => client.set_status(&status).await?,
        Input::Read => client.mark_read().await?,
        Input::Quit => return Ok(false),
        Input::Say(text) => {
            client.send_message(&text).await?;
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();

    let client = RealtimeClient::new();
    let session = client.login(&args.server_url, &args.username).await?;
    println!("logged in as {} (user_id={})", session.display_name, session.user_id);
    print_conversations(&client, false).await;

    let printer = tokio::spawn(print_events(Arc::clone(&client)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse_input(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        match run_input(&client, input).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("error: {err}"),
        }
    }

    client.logout().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse_input("  hello there "),
            Ok(Some(Input::Say("hello there".into())))
        );
        assert_eq!(parse_input("   "), Ok(None));
    }

    #[test]
    fn commands_parse_ids_and_members() {
        assert_eq!(
            parse_input("/open 12"),
            Ok(Some(Input::Open(ConversationId(12))))
        );
        assert_eq!(
            parse_input("/group ops 2,3 4"),
            Ok(Some(Input::Group {
                name: "ops".into(),
                members: vec![UserId(2), UserId(3), UserId(4)],
            }))
        );
        assert!(parse_input("/open abc").is_err());
        assert!(parse_input("/nope").is_err());
    }
}
