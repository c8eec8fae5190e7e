use anyhow::Result;
use clap::Parser;
use codenexus::chat::{ChatPipeline, TurnOptions};
use codenexus::config::{self, Config};
use codenexus::events::ChatEvent;
use codenexus::safety::ConfirmRun;
use codenexus::workspace;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "codenexus",
    about = "An agent-mode AI chat companion for your workspace",
    version
)]
struct Args {
    /// Path to the workspace (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Store or replace the OpenRouter API key, then exit
    #[arg(long)]
    setup: bool,

    /// Start in agent mode
    #[arg(long)]
    agent: bool,

    /// Initial model index in the configured roster
    #[arg(short, long)]
    model: Option<usize>,
}

/// Blocking terminal prompt for screened code. Anything but an explicit
/// "y" blocks the run.
struct TerminalConfirm;

impl ConfirmRun for TerminalConfirm {
    fn confirm_run(&self, code: &str, matched: &[&'static str]) -> bool {
        eprintln!();
        eprintln!("  This program matched: {}", matched.join(", "));
        for line in code.lines().take(12) {
            eprintln!("  | {}", line);
        }
        eprint!("  Run it anyway? [y/N] ");
        let _ = io::stderr().flush();

        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if args.setup {
        config::setup_api_key_interactive().map_err(|e| anyhow::anyhow!(e))?;
        return Ok(());
    }

    let root = args.path.canonicalize()?;
    let mut cfg = Config::load();
    let api_key = cfg.get_api_key();
    if api_key.is_none() && !cfg.use_ollama {
        eprintln!("  No API key found. Run 'codenexus --setup' to add one.");
    }
    let excluded_dirs = cfg.excluded_dirs.clone();

    let (tx, rx) = mpsc::channel();
    let printer = std::thread::spawn(move || print_events(rx));

    let mut pipeline = ChatPipeline::new(cfg, api_key, root.clone(), Arc::new(TerminalConfirm), tx);
    if let Some(index) = args.model {
        pipeline.select_model(index);
    }
    if args.agent {
        pipeline.set_agent_mode(true);
    }

    // Ctrl-C cancels the in-flight response instead of exiting
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let file_titles = workspace::file_titles(&root, &excluded_dirs);
    eprintln!(
        "  codenexus ready in {} ({} files indexed). Type /help for commands.",
        root.display(),
        file_titles.values().map(|v| v.len()).sum::<usize>()
    );

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            if !handle_command(command, &mut pipeline) {
                break;
            }
            continue;
        }

        let mentioned_files = workspace::find_mentions(line, &file_titles);
        let opts = TurnOptions {
            mentioned_files,
            attachments: Vec::new(),
        };
        pipeline.submit_turn(line, opts).await?;
    }

    drop(pipeline);
    let _ = printer.join();
    Ok(())
}

/// Dispatch a slash command. Returns false to quit.
fn handle_command(command: &str, pipeline: &mut ChatPipeline) -> bool {
    let mut parts = command.splitn(2, ' ');
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().unwrap_or_default().trim();

    match name {
        "quit" | "exit" => return false,
        "help" => print_help(),
        "models" => {
            for (i, entry) in pipeline.roster().entries().iter().enumerate() {
                let marker = if i == pipeline.model_index() { "*" } else { " " };
                println!(" {} [{}] {} ({})", marker, i, entry.name, entry.id);
            }
        }
        "model" => match arg.parse::<usize>() {
            Ok(index) => pipeline.select_model(index),
            Err(_) => println!("usage: /model <index>"),
        },
        "mode" => match arg {
            "agent" => pipeline.set_agent_mode(true),
            "chat" => pipeline.set_agent_mode(false),
            _ => println!("usage: /mode agent|chat"),
        },
        "run" => {
            if arg.is_empty() {
                println!("usage: /run <key or pasted code>");
            } else if !pipeline.run_block(arg) {
                // Not a key; try fuzzy-matching pasted block text
                match pipeline.match_block(arg, true) {
                    Some(key) => {
                        pipeline.run_block(&key);
                    }
                    None => println!("no pending block matches"),
                }
            }
        }
        "kill" => pipeline.kill_run(arg),
        "ps" => {
            for (key, pid) in pipeline.running_programs() {
                println!("  {} (pid {})", key, pid);
            }
        }
        "blocks" => {
            for key in pipeline.pending_block_keys() {
                println!("  {}", key);
            }
        }
        "context" => match arg.parse::<usize>() {
            Ok(capacity) => pipeline.change_context_capacity(capacity),
            Err(_) => {
                for (location, name) in pipeline.context_entries() {
                    println!("  {} ({})", name, location.display());
                }
            }
        },
        "drop" => pipeline.remove_context_entry(std::path::Path::new(arg)),
        "out" => match arg {
            "off" => pipeline.set_write_to_file(false, None),
            "" => println!("usage: /out <file name>|off"),
            name => pipeline.set_write_to_file(true, Some(name.to_string())),
        },
        "snippet" => match arg {
            "off" => pipeline.clear_snippet(),
            "" => println!("usage: /snippet <text>|off (sent with your next question)"),
            text => pipeline.set_snippet(text, true),
        },
        "clear" => pipeline.clear_history(),
        "new" => {
            pipeline.new_session();
        }
        "sessions" => {
            let current = pipeline.current_session_id();
            for (id, title) in pipeline.session_titles() {
                let marker = if id == current { "*" } else { " " };
                println!(" {} [{}] {}", marker, id, title);
            }
        }
        "session" => match arg.parse::<u64>() {
            Ok(id) => {
                if !pipeline.switch_session(id) {
                    println!("no such session");
                }
            }
            Err(_) => println!("usage: /session <id>"),
        },
        other => println!("unknown command: /{} (try /help)", other),
    }
    true
}

fn print_help() {
    println!("  /models            list configured models");
    println!("  /model <i>         select the model to start from");
    println!("  /mode agent|chat   toggle agent mode");
    println!("  /run <key|code>    run an extracted block");
    println!("  /kill <key>        stop a running program");
    println!("  /ps                list running programs");
    println!("  /blocks            list pending runnable blocks");
    println!("  /context [n]       show cached files, or set capacity");
    println!("  /drop <path>       remove a file from the context cache");
    println!("  /snippet <t>|off   attach code text to your next question");
    println!("  /out <name>|off    divert responses to <name>.md");
    println!("  /clear             clear this session's history");
    println!("  /new /sessions /session <id>   manage sessions");
    println!("  /quit              exit");
    println!("  Mention files with @name.ext; Ctrl-C cancels a response.");
}

/// Print pipeline events as they arrive. Runs on its own thread so output
/// keeps flowing while the main task drives the stream.
fn print_events(rx: mpsc::Receiver<ChatEvent>) {
    for event in rx {
        match event {
            ChatEvent::ResponseStarted { .. } => {}
            ChatEvent::ResponseDelta { text, .. } => {
                print!("{}", text);
                let _ = io::stdout().flush();
            }
            ChatEvent::ResponseComplete { .. } => println!(),
            ChatEvent::TurnFailed { message, .. } => println!("\n  error: {}", message),
            ChatEvent::Interrupted { notice, .. } => println!("\n  interrupted. {}", notice),
            ChatEvent::ModelSwitched { name } => eprintln!("\n  switching to {}...", name),
            ChatEvent::ResponseWrittenToFile { path, .. } => {
                println!("  response written to {}", path.display());
            }
            ChatEvent::RunnableBlock { key, .. } => {
                eprintln!("\n  [runnable block: /run {}]", key);
            }
            ChatEvent::RunStarted { key, pid } => eprintln!("  [{} running, pid {}]", key, pid),
            ChatEvent::RunRefused { key, reason } => {
                eprintln!("  [{} not started: {}]", key, reason);
            }
            ChatEvent::RunFinished { key, outcome } => {
                eprintln!("  [{} finished: {:?}]", key, outcome);
            }
            ChatEvent::ContextUpdated { entries } => {
                let names: Vec<&str> = entries.iter().map(|(_, n)| n.as_str()).collect();
                eprintln!("  [context: {}]", names.join(", "));
            }
            ChatEvent::Busy => eprintln!("  still responding; Ctrl-C to cancel first"),
        }
    }
}
