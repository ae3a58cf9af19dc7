//! `localapi ask` — One turn from the terminal, streamed as it arrives.

use localapi_config::AppConfig;
use localapi_core::event::StreamEvent;
use localapi_core::message::ThreadId;
use localapi_engine::TurnRequest;
use std::io::Write;
use tokio::sync::mpsc;

pub async fn run(config: AppConfig, text: String, thread: Option<String>) -> anyhow::Result<()> {
    let orchestrator = super::build_orchestrator(&config).await?;

    let mut request = TurnRequest::new(text);
    if let Some(id) = thread {
        request = request.on_thread(ThreadId(id));
    }

    let (tx, mut rx) = mpsc::channel(64);
    let turn = tokio::spawn(async move { orchestrator.respond(request, Some(tx)).await });

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Start { thread_id, .. } => {
                eprintln!("  [thread {thread_id}]");
            }
            StreamEvent::Delta { text } => {
                print!("{text}");
                stdout.flush()?;
            }
            StreamEvent::End { usage, .. } => {
                println!();
                eprintln!(
                    "  [{} prompt + {} completion tokens]",
                    usage.prompt_tokens, usage.completion_tokens
                );
            }
            StreamEvent::Error { message, .. } => {
                println!();
                eprintln!("  [Error] {message}");
            }
        }
    }

    let outcome = turn.await??;
    if !outcome.is_completed() {
        anyhow::bail!(
            "Turn {} failed: {}",
            outcome.response.response_id,
            outcome.response.error.unwrap_or_default()
        );
    }
    eprintln!("  [response {}]", outcome.response.response_id);

    Ok(())
}
