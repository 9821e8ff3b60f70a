use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{ChatClient, ClientEvent, EventChannel, HttpHistoryApi};
use shared::domain::{Message, UserName};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::Command;
use config::{load_settings, Settings, CONFIG_FILE};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Direct conversation to open on start.
    #[arg(long, conflicts_with = "group")]
    peer: Option<String>,
    /// Group conversation to open on start.
    #[arg(long)]
    group: Option<String>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.server_url {
            settings.server_url = v.clone();
        }
        if let Some(v) = &self.username {
            settings.username = Some(v.clone());
        }
        if let Some(v) = &self.token {
            settings.token = Some(v.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(&args.config);
    args.apply(&mut settings);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .init();

    let username = settings
        .username
        .as_deref()
        .map(UserName::new)
        .filter(|user| !user.is_empty())
        .ok_or_else(|| anyhow!("a username is required (--username or CHAT_USERNAME)"))?;
    let ws_url = settings.ws_url(&username)?;

    let client = ChatClient::new_with_dependencies(
        username.clone(),
        settings.engine_settings(),
        Arc::new(HttpHistoryApi::new(
            settings.server_url.clone(),
            settings.token.clone(),
        )),
        EventChannel::new(),
    );
    client.start();
    client.connect(&ws_url).await?;
    info!(user = %username, server_url = %settings.server_url, "desktop: connected");

    if let Err(err) = client.refresh_directory().await {
        warn!(error = %err, "desktop: directory refresh failed");
    }

    let renderer = tokio::spawn(render_events(Arc::clone(&client)));

    if let Some(peer) = &args.peer {
        report(client.select_direct(peer).await);
    } else if let Some(group) = &args.group {
        report(client.select_group(group).await);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match commands::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => report(run_command(&client, command).await),
            Err(err) => eprintln!("{err}"),
        }
    }

    client.shutdown();
    renderer.abort();
    Ok(())
}

async fn run_command(client: &ChatClient, command: Command) -> Result<()> {
    match command {
        Command::Send(text) => client.send_message(&text).await.map(|_| ()),
        Command::Like(id) => client.like(&id).await,
        Command::Delete(id) => client.delete(&id).await,
        Command::Direct(user) => client.select_direct(&user).await,
        Command::Group(group) => client.select_group(&group).await,
        Command::Create { name, members } => {
            let members: Vec<&str> = members.iter().map(String::as_str).collect();
            client.create_group(&name, &members).await
        }
        Command::Add { group, user } => client.add_member(&group, &user).await,
        Command::Remove { group, user } => client.remove_member(&group, &user).await,
        Command::Promote { group, user } => client.promote_admin(&group, &user).await,
        Command::Exit(group) => client.exit_group(&group).await,
        Command::Who => {
            print_directory(client).await;
            Ok(())
        }
        Command::Quit | Command::Empty => Ok(()),
    }
}

fn report(result: Result<()>) {
    if let Err(err) = result {
        eprintln!("error: {err:#}");
    }
}

async fn render_events(client: Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    loop {
        match events.recv().await {
            Ok(ClientEvent::MessagesChanged { conversation }) => {
                println!("--- {conversation} ---");
                for message in client.messages().await {
                    println!("{}", format_message(&message, client.current_user()));
                }
            }
            Ok(ClientEvent::ConversationUnbound { conversation }) => {
                println!("--- {conversation} is no longer available ---");
            }
            Ok(ClientEvent::BackgroundMessage { message }) => {
                println!("(new message in {} from {})", message.conversation, message.sender);
            }
            Ok(ClientEvent::ServerError(message)) => eprintln!("server: {message}"),
            Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
            Ok(ClientEvent::DirectoryChanged | ClientEvent::PresenceChanged) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "desktop: render loop lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn format_message(message: &Message, viewer: &UserName) -> String {
    let mut line = format!(
        "[{}] {} {}: {}",
        message.handle(),
        message.timestamp.format("%H:%M:%S"),
        message.sender,
        message.display_content(viewer)
    );
    if !message.liked_by.is_empty() {
        line.push_str(&format!(" (likes: {})", message.liked_by.len()));
    }
    if !message.is_confirmed() {
        line.push_str(" (sending)");
    }
    line
}

async fn print_directory(client: &ChatClient) {
    let directory = client.directory().await;
    println!("peers:");
    for peer in directory.peers() {
        let status = if directory.is_online(peer) {
            "online"
        } else {
            "offline"
        };
        println!("  {peer} ({status})");
    }
    println!("groups:");
    for group in directory.groups() {
        println!(
            "  {} {} ({} members)",
            group.id,
            group.name,
            group.members.len()
        );
    }
}
