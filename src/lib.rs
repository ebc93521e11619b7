// Declare the modules
pub mod api;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod preload;
pub mod rate_limit;
pub mod retry;
pub mod session;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::api::{ChatTransport, HttpTransport};
use crate::config::{get_api_key, set_api_key_in_keyring, EngineConfig};
use crate::engine::StreamingEngine;
use crate::models::Role;
use crate::preload::{NoopPreloader, PredictivePreloader, Preloader};
use crate::session::{ChatSession, SessionEvent};

const HELP: &str = "Commands: /retry, /clear, /stats, /key <api key>, /quit";

/// Terminal driver: reads queries from stdin and prints streamed answers.
pub async fn run() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let config = EngineConfig::from_env()?;
    let profile = config.load_profile()?;
    let api_key = get_api_key(&config)?;

    let transport: Arc<dyn ChatTransport> = Arc::new(HttpTransport::new(config.endpoint.clone(), api_key));
    let preload_enabled = config.preload.enabled;
    let engine = StreamingEngine::start(config, transport);

    let preloader: Arc<dyn Preloader> = if preload_enabled {
        let preloader = PredictivePreloader::new(Arc::clone(&engine));
        preloader.activate(profile.clone());
        Arc::new(preloader)
    } else {
        Arc::new(NoopPreloader)
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = ChatSession::new(Arc::clone(&engine), preloader).with_event_sink(events_tx);
    let printer = tokio::spawn(print_events(events_rx));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" => break,
            "/retry" => {
                session.retry_last_message().await;
            }
            "/clear" => {
                session.clear_messages();
                println!("(conversation cleared)");
            }
            "/stats" => {
                let performance = session.performance();
                let cache = engine.cache().stats();
                let snapshot = session.snapshot();
                println!(
                    "requests: {}, avg response: {:.0}ms, cache hit rate: {:.0}%, cache entries: {} ({} hits, {} misses)",
                    performance.total_requests,
                    performance.average_response_time,
                    performance.cache_hit_rate * 100.0,
                    cache.entries,
                    cache.hits,
                    cache.misses
                );
                println!(
                    "messages: {}, session: {:?}, connection: {:?}",
                    snapshot.messages.len(),
                    snapshot.state.interaction_pattern,
                    snapshot.state.connection_status
                );
            }
            _ if input.starts_with("/key ") => {
                set_api_key_in_keyring(input.trim_start_matches("/key ").trim())?;
                println!("(API key stored; set apiKeyRef to \"keyring\" and restart to use it)");
            }
            _ if input.starts_with('/') => println!("{}", HELP),
            query => {
                session.send_message(query, profile.as_ref()).await;
            }
        }
    }

    session.cancel();
    drop(session);
    printer.abort();
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::MessageChunk { delta, is_first_chunk, .. } => {
                if is_first_chunk {
                    print!("assistant> ");
                }
                print!("{}", delta);
                let _ = stdout.flush();
            }
            SessionEvent::MessageAppended { message } if !message.is_streaming && message.role == Role::Assistant => {
                // cached answers and fallbacks arrive whole
                println!("assistant> {}", message.content);
                print_extras(&message.suggestions, &message.action_items);
            }
            SessionEvent::MessageFinished { message } => {
                println!();
                print_extras(&message.suggestions, &message.action_items);
            }
            SessionEvent::StatusChanged { state } if !state.is_streaming => {
                if let Some(ms) = state.response_time_ms {
                    log::debug!("Answered in {}ms (cache hit: {})", ms, state.cache_hit);
                }
            }
            _ => {}
        }
    }
}

fn print_extras(suggestions: &[String], action_items: &[String]) {
    for suggestion in suggestions {
        println!("  ? {}", suggestion);
    }
    for item in action_items {
        println!("  - {}", item);
    }
}
