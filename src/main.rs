use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;

use ollachat::config::{default_config_path, load_config};
use ollachat::models::{test_connection, ModelRegistry};
use ollachat::protocol::ChatEvent;
use ollachat::token_estimate::estimate_tokens;
use ollachat::{ChatSession, StagedFile};

#[derive(Parser)]
#[command(name = "ollachat", version, about = "Chat with an Ollama-compatible model server")]
struct Cli {
    /// Server base URL (overrides config and OLLAMA_URL)
    #[arg(long)]
    url: Option<String>,

    /// Model name to chat with
    #[arg(long)]
    model: Option<String>,

    /// System prompt override
    #[arg(long)]
    system: Option<String>,

    /// Enable a tool category (repeatable): web_search, file_analysis
    #[arg(long = "enable-tool", value_name = "TOOL")]
    enable_tools: Vec<String>,

    /// Stage a file for analysis before the chat starts
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Attach an image to the first message (repeatable)
    #[arg(long, value_name = "PATH")]
    image: Vec<PathBuf>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Check server connectivity and exit
    #[arg(long)]
    check: bool,

    /// List available models and exit
    #[arg(long)]
    list_models: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path);
    if let Some(url) = cli.url {
        config.base_url = url;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(system) = cli.system {
        config.system_prompt = system;
    }
    for tool in &cli.enable_tools {
        config.enabled_tools.insert(tool.clone());
    }

    if cli.check {
        match test_connection(&config.base_url).await {
            Ok(()) => println!("Connected to {}", config.base_url),
            Err(e) => {
                eprintln!("Connection failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if cli.list_models {
        let mut registry = ModelRegistry::new();
        for model in registry.list_models(&config.base_url).await {
            println!("{}", model.name);
        }
        return;
    }

    let mut session = ChatSession::new(config);

    if let Some(path) = &cli.file {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                session.stage_file(StagedFile::new(name, content));
            }
            Err(e) => {
                eprintln!("Cannot read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    let mut pending_images = encode_images(&cli.image);

    println!(
        "ollachat — model {} at {} (/quit to exit, /clear to reset, /file <path> to stage a file)",
        session.config.model, session.config.base_url
    );

    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        match line.as_str() {
            "/quit" | "/exit" => break,
            "/clear" => {
                session.clear();
                println!("History cleared.");
                continue;
            }
            "/unfile" => {
                session.clear_staged_file();
                println!("Staged file removed.");
                continue;
            }
            _ if line.starts_with("/file ") => {
                let path = PathBuf::from(line["/file ".len()..].trim());
                match std::fs::read_to_string(&path) {
                    Ok(content) => {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.display().to_string());
                        session.stage_file(StagedFile::new(name, content));
                        println!("Staged {}.", path.display());
                    }
                    Err(e) => eprintln!("Cannot read {}: {}", path.display(), e),
                }
                continue;
            }
            _ => {}
        }

        // Per-turn channel: the printer thread drains until the sender side
        // drops, which happens right after the turn completes.
        let (tx, rx) = channel();
        let printer = std::thread::spawn(move || render_events(rx));

        let images = pending_images.take();
        let result = session.send_message(&line, images, &tx).await;
        drop(tx);
        let _ = printer.join();

        if let Err(e) = result {
            eprintln!("[CHAT] {}", e);
        } else if let Some(last) = session.history().last() {
            eprintln!("[CHAT] ~{} tokens in reply", estimate_tokens(&last.content));
        }
    }
}

fn encode_images(paths: &[PathBuf]) -> Option<Vec<String>> {
    if paths.is_empty() {
        return None;
    }
    let mut encoded = Vec::with_capacity(paths.len());
    for path in paths {
        match std::fs::read(path) {
            Ok(bytes) => encoded.push(BASE64.encode(bytes)),
            Err(e) => {
                eprintln!("Cannot read image {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }
    Some(encoded)
}

fn render_events(rx: Receiver<ChatEvent>) {
    for event in rx {
        match event {
            ChatEvent::Chunk(text) => {
                print!("{}", text);
                let _ = io::stdout().flush();
            }
            ChatEvent::Thinking(text) => {
                eprint!("{}", text);
            }
            ChatEvent::Revised { regular, .. } => {
                // The terminal cannot rewind already-printed text; reprint
                // the corrected content on a fresh line.
                println!();
                print!("{}", regular);
                let _ = io::stdout().flush();
            }
            ChatEvent::ToolStarted { name, .. } => {
                println!("\n[tool] running {}...", name);
            }
            ChatEvent::ToolFinished { name, ok, .. } => {
                if ok {
                    println!("[tool] {} finished", name);
                } else {
                    println!("[tool] {} failed", name);
                }
            }
            ChatEvent::SynthesisStarted => {
                println!("[tool] synthesizing answer...");
            }
            ChatEvent::Done(usage) => {
                println!();
                if let (Some(prompt), Some(eval)) = (usage.prompt_eval_count, usage.eval_count) {
                    eprintln!("[CHAT] {} prompt + {} response tokens", prompt, eval);
                }
            }
            ChatEvent::Warning(msg) => eprintln!("[CHAT] Warning: {}", msg),
            ChatEvent::Error(msg) => eprintln!("[CHAT] Error: {}", msg),
        }
    }
}
