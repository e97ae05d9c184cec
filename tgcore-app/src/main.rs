//! tgcore-app: interactive login, chat listing and a live update stream.
//!
//! Settings are read from a JSON file (default `tgcore.json`, or the first
//! argument). Only `api_id` and `api_hash` are required:
//!
//! ```json
//! { "api_id": 12345, "api_hash": "0123456789abcdef", "home_dc": 2 }
//! ```
//!
//! Then run:
//!   cargo run -p tgcore-app -- tgcore.json
//!
//! Logging follows `RUST_LOG` (default `tgcore_client=info,tgcore_app=info`).

use std::io::{self, BufRead, Write};
use std::path::Path;

use chrono::DateTime;
use tgcore_client::{Client, Config, FileSessionStore, InvocationError, Message, Settings, Update};

const DEFAULT_CONFIG: &str = "tgcore.json";
const SESSION_FILE: &str = "tgcore.session";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("tgcore_client=info,tgcore_app=info"))
        .init();

    if let Err(e) = run().await {
        eprintln!("\n✗ {e}");
        std::process::exit(1);
    }
}

fn load_settings(path: &Path) -> Result<Settings, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let settings: Settings = serde_json::from_str(&text).map_err(|e| format!("invalid {}: {e}", path.display()))?;
    if settings.api_id == 0 || settings.api_hash.is_empty() {
        return Err(format!("set api_id and api_hash in {} (https://my.telegram.org)", path.display()).into());
    }
    Ok(settings)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_owned());
    let settings = load_settings(Path::new(&config_path))?;
    log::info!("[tgcore-app] loaded settings from {config_path}");

    let config = Config::new(settings).with_session_store(FileSessionStore::new(SESSION_FILE));
    let client = Client::connect(config).await?;

    if client.is_authorized().await? {
        println!("✅ Already logged in");
    } else {
        login(&client).await?;
    }

    let me = client.get_self().await?;
    println!("👤 {} (id={})", me.full_name(), me.id);

    // ── Chats ──────────────────────────────────────────────────────────
    println!("\n📋 Recent chats:");
    for dialog in client.get_dialogs(10).await? {
        let pin = if dialog.is_pinned { "📌" } else { "  " };
        println!("{pin} {:>16}  {:<32} unread: {}", dialog.id, dialog.name, dialog.unread_count);
    }

    // ── Update stream ──────────────────────────────────────────────────
    println!("\n👂 Listening for updates (Ctrl+C to quit) …\n");
    let mut updates = client.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.next() => match update {
                Some(update) => print_update(&update),
                None => break,
            },
        }
    }

    if updates.dropped() > 0 {
        log::warn!("[tgcore-app] {} updates were dropped while the console was busy", updates.dropped());
    }
    client.disconnect().await;
    Ok(())
}

async fn login(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    let phone = prompt("Phone number (international format): ")?;
    let token = client.request_code(&phone).await?;
    println!("📱 Code sent to {phone}");

    loop {
        let code = prompt("Enter the code you received: ")?;
        match client.sign_in(&token, &code, None).await {
            Ok(user) => {
                println!("✅ Signed in as {}", user.full_name());
                return Ok(());
            }
            Err(InvocationError::InvalidCode) => println!("✗ Wrong code, try again"),
            Err(InvocationError::TwoFactorRequired { hint }) => {
                let hint = hint.unwrap_or_else(|| "(no hint)".into());
                let password = prompt(&format!("2FA password (hint: {hint}): "))?;
                let user = client.check_password(&password).await?;
                println!("✅ Signed in as {}", user.full_name());
                return Ok(());
            }
            Err(InvocationError::SignUpRequired) => {
                return Err("this number is not registered; sign up with an official app first".into());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_update(update: &Update) {
    match update {
        Update::NewMessage(message) => println!("📨 {}", describe(message)),
        Update::MessageEdited(message) => println!("✏️  {}", describe(message)),
        Update::MessagesDeleted(deletion) => println!("🗑️  Messages deleted: {:?}", deletion.message_ids),
        Update::UserStatus { user_id, status } => log::debug!("[tgcore-app] user {user_id} is now {status:?}"),
        Update::Raw(raw) => log::debug!("[tgcore-app] unhandled {}", raw.name()),
        _ => {}
    }
}

fn describe(message: &Message) -> String {
    let when = DateTime::from_timestamp(i64::from(message.date), 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let from = message
        .sender
        .as_ref()
        .and_then(|s| s.first_name.clone().or_else(|| s.username.clone()))
        .unwrap_or_else(|| message.chat_id.to_string());
    format!("[{when}] {from} (chat {}, id {}): {}", message.chat_id, message.id, message.text)
}

fn prompt(msg: &str) -> io::Result<String> {
    print!("{msg}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
