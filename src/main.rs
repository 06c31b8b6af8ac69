//! Parley - a natural-language chat client for your database.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use db_parley::backend::{
    BackendConfig, DbConnection, HttpBackend, LlmConfig, MockBackend, ModelProvider, ProbeRequest,
    ResultSet, SqlExecutor, SqlGenerator, VisualizationAdvisor,
};
use db_parley::cli::Cli;
use db_parley::config::Config;
use db_parley::logging;
use db_parley::orchestrator::{
    rendered_view, OrchestratorActor, OrchestratorHandle, OrchestratorResponse, SessionContext,
    TurnId, TurnOrchestrator,
};
use db_parley::store::{message_log, session_log, ChatStore, MessageRole, StoredMessage};

const HELP_TEXT: &str = r#"Commands:
  /help            - Show this help
  /schema          - Show the connected database schema
  /sessions        - List chat sessions
  /new [title]     - Start a new session
  /open <id>       - Switch to an existing session
  /delete <id>     - Delete a session (not the current one)
  /history         - Reprint the current session's transcript
  /viz <msg-id>    - Ask for a chart recommendation for a result message
  /quit            - Exit

Anything else is sent to the model as a question about your data."#;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    logging::init_stderr_logging();

    if let Err(e) = run().await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    let config = Config::load_from_file(&cli.config_path())?;

    let db = resolve_connection(&cli, &config)?;
    let llm = resolve_llm(&cli, &config)?;

    let store = match &cli.store {
        Some(path) => ChatStore::open(path).await?,
        None => ChatStore::open_default().await?,
    };
    let store = Arc::new(store);

    let session_id = match cli.session {
        Some(id) => {
            session_log::get_session(store.pool(), id)
                .await?
                .with_context(|| format!("No session with id {id}"))?
                .id
        }
        None => {
            session_log::create_session(store.pool(), "local", None)
                .await?
                .id
        }
    };

    // Backend clients: one HTTP client implements all three roles, or a mock
    // when running without the service.
    let http: Option<Arc<HttpBackend>>;
    let generator: Arc<dyn SqlGenerator>;
    let executor: Arc<dyn SqlExecutor>;
    let advisor: Arc<dyn VisualizationAdvisor>;

    if cli.mock {
        let mock = Arc::new(MockBackend::new());
        http = None;
        generator = Arc::clone(&mock) as Arc<dyn SqlGenerator>;
        executor = Arc::clone(&mock) as Arc<dyn SqlExecutor>;
        advisor = mock as Arc<dyn VisualizationAdvisor>;
    } else {
        let backend_url = cli
            .backend
            .clone()
            .unwrap_or_else(|| config.backend.url.clone());
        let backend = Arc::new(HttpBackend::new(
            BackendConfig::new(backend_url).with_timeout(config.backend.timeout_secs),
        )?);

        connect_and_report(&backend, &db, &llm).await?;

        http = Some(Arc::clone(&backend));
        generator = Arc::clone(&backend) as Arc<dyn SqlGenerator>;
        executor = Arc::clone(&backend) as Arc<dyn SqlExecutor>;
        advisor = backend as Arc<dyn VisualizationAdvisor>;
    }

    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::clone(&store),
        generator,
        executor,
        advisor,
    ));

    let (response_tx, mut response_rx) = mpsc::channel(32);
    let (handle, actor) = OrchestratorActor::spawn(orchestrator, response_tx);
    let actor_task = tokio::spawn(actor.run());

    let mut ctx = SessionContext {
        session_id,
        db,
        llm,
    };

    println!(
        "Parley - chatting with {} (session {}). Type /help for commands.",
        ctx.db.display_string(),
        ctx.session_id
    );
    print_transcript(&store, ctx.session_id, 0).await?;

    let mut last_seen = latest_message_id(&store, ctx.session_id).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            prompt();
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match handle_command(command, &store, http.as_deref(), &handle, &mut ctx, &mut response_rx)
                .await
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => println!("Error: {e:#}"),
            }
            last_seen = latest_message_id(&store, ctx.session_id).await?;
            prompt();
            continue;
        }

        let id = TurnId::new();
        handle
            .submit_prompt(id, line, ctx.clone(), CancellationToken::new())
            .await?;
        wait_for_turn(&mut response_rx, id).await;

        last_seen = print_transcript(&store, ctx.session_id, last_seen).await?;
        prompt();
    }

    handle.close().await.ok();
    actor_task.await.ok();
    store.close().await;
    Ok(())
}

fn prompt() {
    print!("> ");
    std::io::stdout().flush().ok();
}

/// Resolves the final connection descriptor from CLI args and config.
///
/// Precedence: CLI flags, then the named profile, then the default profile.
fn resolve_connection(cli: &Cli, config: &Config) -> anyhow::Result<DbConnection> {
    if let Some(conn) = cli.to_db_connection()? {
        return Ok(conn);
    }

    let mut profile = match cli.connection_name() {
        Some(name) => config
            .get_connection(Some(name))
            .with_context(|| format!("Connection '{name}' not found in config file"))?
            .clone(),
        None => config.get_connection(None).cloned().unwrap_or_default(),
    };

    profile.apply_env_defaults();

    if profile.database.is_none() && cli.mock {
        // The mock backend never dials a database; give it a placeholder.
        profile.db_type = "sqlite".to_string();
        profile.database = Some("mock.db".to_string());
    }

    profile
        .to_db_connection()
        .context("No database connection configured. Pass -d/--database or add a config profile.")
}

/// Resolves the model descriptor from CLI args and config.
fn resolve_llm(cli: &Cli, config: &Config) -> anyhow::Result<LlmConfig> {
    let mut settings = config.llm.clone();
    if let Some(provider) = &cli.llm {
        settings.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        settings.model = model.clone();
    }
    Ok(settings.to_wire_config()?)
}

/// Tests the database connection, probes the model, and prints the schema.
async fn connect_and_report(
    backend: &HttpBackend,
    db: &DbConnection,
    llm: &LlmConfig,
) -> anyhow::Result<()> {
    let status = backend.test_connection(db).await?;
    if !status.success {
        bail!(
            "Database connection failed: {}",
            status.message.unwrap_or_else(|| "unknown error".into())
        );
    }

    if llm.provider == ModelProvider::Ollama {
        let probe = ProbeRequest {
            provider: ModelProvider::Ollama,
            url: llm
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        };
        if let Err(e) = backend.probe_model(&probe).await {
            warn!("Model probe failed: {e}");
        }
    }

    match backend.fetch_schema(db).await {
        Ok(schema) => println!("{}", schema.format_for_display()),
        Err(e) => warn!("Connected, but schema fetch failed: {e}"),
    }

    Ok(())
}

/// Handles a slash command. Returns true when the REPL should exit.
async fn handle_command(
    command: &str,
    store: &Arc<ChatStore>,
    http: Option<&HttpBackend>,
    handle: &OrchestratorHandle,
    ctx: &mut SessionContext,
    response_rx: &mut mpsc::Receiver<OrchestratorResponse>,
) -> anyhow::Result<bool> {
    let mut parts = command.splitn(2, ' ');
    let name = parts.next().unwrap_or("").to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");

    match name.as_str() {
        "help" => println!("{HELP_TEXT}"),
        "quit" | "exit" => return Ok(true),
        "schema" => match http {
            Some(backend) => match backend.fetch_schema(&ctx.db).await {
                Ok(schema) => println!("{}", schema.format_for_display()),
                Err(e) => println!("Error: {e}"),
            },
            None => println!("Schema is not available with the mock backend."),
        },
        "sessions" => {
            for session in session_log::list_sessions(store.pool(), "local").await? {
                let marker = if session.id == ctx.session_id { "*" } else { " " };
                println!(
                    "{marker} {}  {}  {}",
                    session.id,
                    session.updated_at,
                    session.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        "new" => {
            let title = if args.is_empty() { None } else { Some(args) };
            let session = session_log::create_session(store.pool(), "local", title).await?;
            ctx.session_id = session.id;
            println!("Switched to new session {}.", session.id);
        }
        "open" => {
            let id: i64 = args.parse().context("Usage: /open <session-id>")?;
            let session = session_log::get_session(store.pool(), id)
                .await?
                .with_context(|| format!("No session with id {id}"))?;
            ctx.session_id = session.id;
            println!("Switched to session {}.", session.id);
            print_transcript(store, session.id, 0).await?;
        }
        "delete" => {
            let id: i64 = args.parse().context("Usage: /delete <session-id>")?;
            if id == ctx.session_id {
                println!("Refusing to delete the current session. /open another one first.");
            } else if session_log::delete_session(store.pool(), id).await? {
                println!("Deleted session {id}.");
            } else {
                println!("No session with id {id}.");
            }
        }
        "history" => {
            print_transcript(store, ctx.session_id, 0).await?;
        }
        "viz" => {
            let message_id: i64 = args.parse().context("Usage: /viz <message-id>")?;
            let before = latest_message_id(store, ctx.session_id).await?;
            let id = TurnId::new();
            handle
                .request_visualization(id, message_id, ctx.clone(), CancellationToken::new())
                .await?;
            wait_for_turn(response_rx, id).await;
            print_transcript(store, ctx.session_id, before).await?;
        }
        _ => println!("Unknown command: /{name}. Type /help for available commands."),
    }

    Ok(false)
}

/// Drains responses until the given turn reaches a terminal response.
async fn wait_for_turn(response_rx: &mut mpsc::Receiver<OrchestratorResponse>, id: TurnId) {
    while let Some(response) = response_rx.recv().await {
        match response {
            OrchestratorResponse::Completed { id: resp_id, .. } if resp_id == id => return,
            OrchestratorResponse::VisualizationDone { id: resp_id } if resp_id == id => return,
            OrchestratorResponse::Cancelled { id: resp_id } if resp_id == id => {
                println!("(cancelled)");
                return;
            }
            OrchestratorResponse::Failed { id: resp_id, error } if resp_id == id => {
                println!("Error: {error}");
                return;
            }
            _ => {}
        }
    }
}

/// Returns the id of the newest message in a session, or 0 when empty.
async fn latest_message_id(store: &Arc<ChatStore>, session_id: i64) -> anyhow::Result<i64> {
    let messages = message_log::list_messages(store.pool(), session_id).await?;
    Ok(messages.last().map(|m| m.id).unwrap_or(0))
}

/// Prints the rendered view of messages newer than `after`, returning the
/// newest printed id.
async fn print_transcript(
    store: &Arc<ChatStore>,
    session_id: i64,
    after: i64,
) -> anyhow::Result<i64> {
    let messages = message_log::list_messages(store.pool(), session_id).await?;
    let mut last = after;

    for message in rendered_view(&messages) {
        if message.id <= after {
            continue;
        }
        print_message(message);
        last = message.id;
    }

    Ok(last)
}

fn print_message(message: &StoredMessage) {
    match message.role {
        MessageRole::User => println!("you> {}", message.content),
        MessageRole::Assistant => {
            println!("assistant [{}]> {}", message.id, message.content);
            if let Some(sql) = &message.sql {
                println!("    {sql}");
            }
        }
        MessageRole::System => {
            println!("system [{}]> {}", message.id, message.content);
            if let Some(results) = &message.results {
                print_results(results);
            }
        }
    }
}

fn print_results(results: &ResultSet) {
    if results.columns.is_empty() {
        return;
    }

    let mut widths: Vec<usize> = results.columns.iter().map(String::len).collect();
    let rendered: Vec<Vec<String>> = results
        .rows
        .iter()
        .map(|row| row.iter().map(render_value).collect())
        .collect();

    for row in &rendered {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() && cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let header: Vec<String> = results
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c:<width$}", width = widths[i]))
        .collect();
    println!("    {}", header.join(" | "));
    println!(
        "    {}",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-")
    );

    for row in &rendered {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let width = widths.get(i).copied().unwrap_or(cell.len());
                format!("{cell:<width$}")
            })
            .collect();
        println!("    {}", cells.join(" | "));
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
