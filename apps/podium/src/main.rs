use anyhow::Result;
use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use podium_client_core::config::Config;
use podium_client_core::protocol::SessionStatus;
use podium_client_core::session::{
    ConnectionState, ConnectionSupervisor, QuizState, SessionClient, SessionStore,
};
use podium_client_core::transport::websocket::WebSocketConnector;
use podium_client_core::transport::TransportHandle;

#[derive(Parser, Debug)]
#[command(name = "podium", about = "Join a live quiz session as a participant")]
struct Cli {
    /// Session code to join (4-8 characters, case-insensitive)
    #[arg(long, short = 'j')]
    join: String,

    /// Display name shown to the host and other participants
    #[arg(long, short = 'n')]
    name: String,

    /// Mascot avatar id; picked at random when omitted
    #[arg(long)]
    avatar: Option<u8>,

    /// Session server address (overrides PODIUM_SESSION_SERVER)
    #[arg(long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(server) = cli.server.as_deref() {
        config = config.with_server(server)?;
    }
    let avatar = cli
        .avatar
        .unwrap_or_else(|| rand::thread_rng().gen_range(1..=8));

    let transport = TransportHandle::new(Arc::new(WebSocketConnector));
    let store = Arc::new(SessionStore::new());
    let client = SessionClient::new(
        transport.clone(),
        store.clone(),
        config.session_server.clone(),
    );
    let supervisor = ConnectionSupervisor::spawn(transport, store.clone(), config.session_server);

    let session = client.join(&cli.join, &cli.name, avatar).await?;
    println!(
        "joined \"{}\" hosted by {} ({} questions); answer by typing the option number",
        session.title, session.host_name, session.total_questions
    );

    let mut state_rx = store.subscribe();
    let mut status_rx = supervisor.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown_question: Option<u32> = None;
    let mut shown_reveals = 0usize;

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                render(&state, &mut shown_question, &mut shown_reveals);
                if state.session.as_ref().map(|s| s.status) == Some(SessionStatus::Finished) {
                    println!("quiz finished");
                    break;
                }
                if state.session.is_none() {
                    break;
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                match status {
                    ConnectionState::Reconnecting => println!("[connection lost, retrying…]"),
                    ConnectionState::Connected => println!("[connected]"),
                    ConnectionState::Failed => {
                        eprintln!("connection failed for good; leaving session");
                        break;
                    }
                    _ => {}
                }
            }
            line = lines.next_line() => match line? {
                Some(input) => submit_answer(&client, input.trim()),
                None => break,
            },
        }
    }

    client.leave();
    Ok(())
}

fn submit_answer(client: &SessionClient, input: &str) {
    if input.is_empty() {
        return;
    }
    let Ok(number) = input.parse::<u32>() else {
        eprintln!("type the option number to answer");
        return;
    };
    if number == 0 {
        eprintln!("options are numbered from 1");
        return;
    }
    if let Err(err) = client.answer(number - 1) {
        eprintln!("{err}");
    }
}

fn render(state: &QuizState, shown_question: &mut Option<u32>, shown_reveals: &mut usize) {
    if let Some(question) = &state.question {
        if *shown_question != Some(question.index) {
            *shown_question = Some(question.index);
            println!(
                "\nquestion {} ({}s): {}",
                question.index + 1,
                question.deadline.as_secs(),
                question.prompt
            );
            for (i, option) in question.options.iter().enumerate() {
                println!("  {}. {option}", i + 1);
            }
        }
    } else {
        *shown_question = None;
    }

    for reveal in state.reveals.iter().skip(*shown_reveals) {
        println!(
            "question {} closed; correct answer was option {}",
            reveal.index + 1,
            reveal.correct_option + 1
        );
    }
    *shown_reveals = state.reveals.len();
}
