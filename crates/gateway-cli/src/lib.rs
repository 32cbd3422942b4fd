#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use gateway_client::{
    CancellationToken, ChatMessage, ChatRequest, GatewayClient, NewApiKey, SessionEvent,
    SharedClientError,
};
use serde::Serialize;

mod coalesce;

pub use coalesce::DeltaCoalescer;

const COALESCE_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Command-line client for the LLM gateway")]
pub struct GatewayCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the session
    Login(LoginArgs),
    /// Create an account and sign in
    Signup(SignupArgs),
    /// Forget the stored session
    Logout,
    /// Show the signed-in profile
    Whoami {
        /// Ignore cached profile data
        #[arg(long)]
        refresh: bool,
    },
    /// Show today's quota usage
    Quota,
    /// List models served by the gateway
    Models,
    /// Manage API keys
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Chat with a model, printing the reply as it arrives
    Chat(ChatArgs),
    /// Check whether the model server is reachable
    Health,
    /// Administrator views
    #[command(subcommand)]
    Admin(AdminCommand),
}

#[derive(Subcommand)]
pub enum AdminCommand {
    /// List all accounts
    Users,
    /// Show gateway host metrics
    Metrics,
    /// List recent security events
    Events,
    /// Show per-model throughput and latency
    Performance,
    /// List pending and decided quota applications
    Applications,
}

#[derive(Args)]
pub struct LoginArgs {
    #[arg(long)]
    pub email: String,
    #[arg(long)]
    pub password: String,
    /// Keep the session after this process exits
    #[arg(long)]
    pub remember: bool,
}

#[derive(Args)]
pub struct SignupArgs {
    #[arg(long)]
    pub email: String,
    #[arg(long)]
    pub password: String,
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub remember: bool,
}

#[derive(Subcommand)]
pub enum KeysCommand {
    /// List keys with their limits and usage
    List,
    /// Create a key; the plain key is shown once
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 1_000)]
        daily_requests: u64,
        #[arg(long, default_value_t = 100_000)]
        daily_tokens: u64,
        #[arg(long, default_value_t = 1_000_000)]
        total_tokens: u64,
    },
    /// Delete a key
    Delete { id: String },
    /// Issue a new secret for an existing key
    Regenerate { id: String },
    /// Show the full secret of a key
    Reveal { id: String },
}

#[derive(Args)]
pub struct ChatArgs {
    #[arg(long, short)]
    pub model: String,
    #[arg(long)]
    pub system: Option<String>,
    #[arg(long)]
    pub temperature: Option<f32>,
    /// Ask reasoning models to think before answering
    #[arg(long)]
    pub think: bool,
    /// Wait for the whole reply instead of streaming it
    #[arg(long)]
    pub no_stream: bool,
    pub prompt: String,
}

pub async fn run() -> Result<()> {
    let cli = GatewayCli::parse();
    let client = GatewayClient::from_env().context("gateway client configuration")?;
    watch_session(&client);

    match cli.command {
        Commands::Login(args) => {
            let profile = client
                .login(&args.email, &args.password, args.remember)
                .await
                .map_err(|error| anyhow!(error.user_message()))?;
            println!("Signed in as {} <{}>", profile.name, profile.email);
            Ok(())
        }
        Commands::Signup(args) => {
            let profile = client
                .signup(&args.email, &args.password, &args.name, args.remember)
                .await
                .map_err(|error| anyhow!(error.user_message()))?;
            println!("Created account for {}", profile.email);
            Ok(())
        }
        Commands::Logout => {
            client.logout();
            println!("Signed out");
            Ok(())
        }
        Commands::Whoami { refresh } => {
            let profile = if refresh {
                client.identity().refresh().await
            } else {
                client.me().await
            }
            .map_err(shared_error)?;
            print_json(&profile)
        }
        Commands::Quota => print_json(&client.quota().await?),
        Commands::Models => print_json(&client.list_models().await?),
        Commands::Keys(command) => run_keys(&client, command).await,
        Commands::Chat(args) => run_chat(&client, args).await,
        Commands::Health => {
            let healthy = client.health().await;
            println!("{}", if healthy { "ok" } else { "unavailable" });
            Ok(())
        }
        Commands::Admin(command) => run_admin(&client, command).await,
    }
}

async fn run_admin(client: &GatewayClient, command: AdminCommand) -> Result<()> {
    match command {
        AdminCommand::Users => print_json(&client.admin_users().await?),
        AdminCommand::Metrics => print_json(&client.admin_metrics().await?),
        AdminCommand::Events => print_json(&client.admin_security_events().await?),
        AdminCommand::Performance => print_json(&client.admin_model_performance().await?),
        AdminCommand::Applications => print_json(&client.admin_applications().await?),
    }
}

async fn run_keys(client: &GatewayClient, command: KeysCommand) -> Result<()> {
    match command {
        KeysCommand::List => print_json(&client.list_keys().await?),
        KeysCommand::Create {
            name,
            daily_requests,
            daily_tokens,
            total_tokens,
        } => {
            let created = client
                .create_key(&NewApiKey {
                    name,
                    daily_requests,
                    daily_tokens,
                    total_tokens,
                })
                .await?;
            if let Some(plain_key) = &created.plain_key {
                println!("{plain_key}");
            }
            print_json(&created.entry)
        }
        KeysCommand::Delete { id } => {
            client.delete_key(&id).await?;
            println!("Deleted {id}");
            Ok(())
        }
        KeysCommand::Regenerate { id } => {
            println!("{}", client.regenerate_key(&id).await?.plain_key);
            Ok(())
        }
        KeysCommand::Reveal { id } => {
            println!("{}", client.reveal_key(&id).await?.key);
            Ok(())
        }
    }
}

fn chat_request(args: &ChatArgs) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(ChatMessage::system(system.as_str()));
    }
    messages.push(ChatMessage::user(args.prompt.as_str()));

    let mut request = ChatRequest::new(args.model.as_str(), messages);
    if let Some(temperature) = args.temperature {
        request = request.with_temperature(temperature);
    }
    if args.think {
        request = request.with_think(true);
    }
    request
}

async fn run_chat(client: &GatewayClient, args: ChatArgs) -> Result<()> {
    let request = chat_request(&args);
    if args.no_stream {
        let reply = client
            .chat(&request)
            .await
            .map_err(|error| anyhow!(error.user_message()))?;
        println!("{reply}");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut stream = client
        .open_chat_stream(&request, cancel)
        .await
        .map_err(|error| anyhow!(error.user_message()))?;
    tracing::debug!(mode = ?stream.mode(), model = %request.model, "chat stream opened");
    let mut coalescer = DeltaCoalescer::default();
    let mut ticker = tokio::time::interval(COALESCE_INTERVAL);
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            delta = stream.next() => match delta {
                Some(text) => coalescer.observe(text),
                None => break,
            },
            _ = ticker.tick() => write_pending(&mut coalescer, &mut stdout)?,
        }
    }

    let outcome = stream.finish().await;
    write_pending(&mut coalescer, &mut stdout)?;
    match outcome {
        Ok(final_text) => {
            coalescer.observe(final_text);
            write_pending(&mut coalescer, &mut stdout)?;
            writeln!(stdout)?;
            Ok(())
        }
        Err(error) => {
            writeln!(stdout)?;
            Err(anyhow!(error.user_message()))
        }
    }
}

fn write_pending(coalescer: &mut DeltaCoalescer, out: &mut impl Write) -> Result<()> {
    if let Some(pending) = coalescer.take_unprinted() {
        out.write_all(pending.as_bytes())?;
        out.flush()?;
    }
    Ok(())
}

fn watch_session(client: &GatewayClient) {
    let mut events = client.session_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event == SessionEvent::Expired {
                eprintln!("Session expired. Run `gateway login` to sign in again.");
            }
        }
    });
}

fn shared_error(error: SharedClientError) -> anyhow::Error {
    anyhow!(error.user_message())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
