//! freshet CLI: operator interface to the rebuild service.

use freshet::config::secrets::{ExposeSecret, redacted_url};
use freshet::config::{Config, Messaging, Options};
use freshet::db::Db;
use freshet::engine::{ControlConfig, ControlPlane, Dispatcher};
use freshet::event::InboundEvent;
use freshet::handler::{Context, RebuildImagesOnRpmAdvisory, default_handlers};
use freshet::model::{ArtifactBuild, ArtifactType, BuildState, EventId, EventType};
use freshet::rules::Attributes;
use freshet::storage::MemoryStore;
use freshet::store::{BuildFilter, EventFilter, Store};
use freshet::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "freshet", about = "Rebuild container images when upstream content changes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane daemon
    Serve {
        /// Record builds without submitting them (overrides the config file)
        #[arg(long)]
        dry_run: bool,
    },
    /// Inbound event operations
    Event {
        #[command(subcommand)]
        action: EventAction,
    },
    /// Artifact build operations
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },
    /// Allow/block rule operations
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Submit an inbound event (JSON) for processing
    Submit {
        /// File holding the event, or "-" for stdin
        file: PathBuf,
        /// Process in this process instead of enqueueing
        #[arg(long)]
        local: bool,
    },
    /// List events
    List {
        /// Filter by event type
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Filter by search key (e.g. advisory id)
        #[arg(long)]
        search_key: Option<String>,
        /// Only events not yet released
        #[arg(long)]
        unreleased: bool,
        /// Maximum events to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show an event and its builds
    Show {
        /// Event ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum BuildAction {
    /// List artifact builds
    List {
        /// Filter by owning event
        #[arg(long)]
        event: Option<i64>,
        /// Filter by state (planned, build, done, failed)
        #[arg(long)]
        state: Option<String>,
        /// Filter by artifact name
        #[arg(long)]
        name: Option<String>,
        /// Maximum builds to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Compile the configured rules and evaluate them against attributes
    Check {
        /// Handler whose rules apply
        #[arg(long, default_value = RebuildImagesOnRpmAdvisory::NAME)]
        handler: String,
        /// Artifact type (module, image, rpm_container)
        #[arg(long = "type", default_value = "image")]
        artifact_type: String,
        /// Attributes as a JSON object; omit to only validate the rules
        #[arg(long)]
        attrs: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let options = config.options()?;

    match cli.command {
        Command::Serve { dry_run } => cmd_serve(&config, options, dry_run).await,
        Command::Event { action } => match action {
            EventAction::Submit { file, local } => {
                let _guard = init_telemetry(telemetry_config(&config))?;
                cmd_event_submit(&config, &options, file, local).await
            }
            EventAction::List {
                event_type,
                search_key,
                unreleased,
                limit,
            } => {
                let db = connect(&config).await?;
                let filter = EventFilter {
                    event_type: event_type.map(|t| t.parse::<EventType>()).transpose()?,
                    search_key,
                    released: unreleased.then_some(false),
                    limit: Some(limit),
                };
                cmd_event_list(&db, &filter).await
            }
            EventAction::Show { id } => {
                let db = connect(&config).await?;
                cmd_event_show(&db, EventId(id)).await
            }
        },
        Command::Build { action } => match action {
            BuildAction::List {
                event,
                state,
                name,
                limit,
            } => {
                let db = connect(&config).await?;
                let filter = BuildFilter {
                    event_id: event.map(EventId),
                    name,
                    state: state.map(|s| s.parse::<BuildState>()).transpose()?,
                    artifact_type: None,
                    limit: Some(limit),
                };
                cmd_build_list(&db, &filter).await
            }
        },
        Command::Rules { action } => match action {
            RulesAction::Check {
                handler,
                artifact_type,
                attrs,
            } => cmd_rules_check(&options, &handler, &artifact_type, attrs.as_deref()),
        },
    }
}

fn telemetry_config(config: &Config) -> TelemetryConfig {
    TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "freshet".to_string(),
        log_level: config.log_level.clone(),
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.require_database_url()?.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

fn handler_context(store: Arc<dyn Store>, options: &Options) -> anyhow::Result<Context> {
    Ok(Context::new(store)
        .rules(Arc::new(options.rules()?))
        .retry(options.retry_policy())
        .dry_run(options.dry_run)
        .release_suffix(options.rebuilt_nvr_release_suffix.clone()))
}

async fn cmd_serve(config: &Config, mut options: Options, dry_run: bool) -> anyhow::Result<()> {
    let _guard = init_telemetry(telemetry_config(config))?;
    options.dry_run |= dry_run;
    if options.messaging != Messaging::Pgmq {
        anyhow::bail!("serve reads the pgmq ingress queue; set messaging = \"pgmq\"");
    }

    let url = config.require_database_url()?;
    tracing::info!(database = %redacted_url(url), dry_run = options.dry_run, "starting freshet");
    let db = Arc::new(connect(config).await?);
    db.health_check().await?;

    let ctx = Arc::new(handler_context(db.clone(), &options)?);
    let dispatcher = Arc::new(Dispatcher::new(default_handlers(ctx)));
    let control = ControlPlane::new(db, dispatcher, ControlConfig::from(&options));

    let ctrl = control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    control.run().await?;
    Ok(())
}

async fn cmd_event_submit(
    config: &Config,
    options: &Options,
    file: PathBuf,
    local: bool,
) -> anyhow::Result<()> {
    let text = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(&file)?
    };
    let event: InboundEvent = serde_json::from_str(&text)?;

    if !local && options.messaging == Messaging::Pgmq {
        let db = connect(config).await?;
        let msg_id = db.enqueue_event(&event).await?;
        println!("Enqueued: {} as message {msg_id}", event.message_id());
        return Ok(());
    }

    // In-process: Postgres if configured, otherwise a throwaway memory store.
    let store: Arc<dyn Store> = match config.database_url {
        Some(_) => Arc::new(connect(config).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let ctx = Arc::new(handler_context(store.clone(), options)?);
    let dispatcher = Dispatcher::new(default_handlers(ctx));
    let dispatched = dispatcher.process(event.clone()).await?;
    println!("Processed: {} ({dispatched} event(s) dispatched)", event.message_id());

    let events = store.list_events(&EventFilter::default()).await?;
    for e in events.iter().filter(|e| e.message_id == event.message_id()) {
        print_builds(&store.builds_for_event(e.id).await?);
    }
    Ok(())
}

async fn cmd_event_list(db: &Db, filter: &EventFilter) -> anyhow::Result<()> {
    let events = db.list_events(filter).await?;
    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<26}  {:<12}  {:<8}  {:<8}  CREATED",
        "ID", "TYPE", "SEARCH_KEY", "RELEASED", "COMPOSE"
    );
    println!("{}", "-".repeat(90));
    for e in &events {
        println!(
            "{:<6}  {:<26}  {:<12}  {:<8}  {:<8}  {}",
            e.id,
            e.event_type,
            e.search_key,
            if e.released { "yes" } else { "no" },
            e.compose_id.map_or("-".to_string(), |c| c.to_string()),
            e.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} event(s)", events.len());
    Ok(())
}

async fn cmd_event_show(db: &Db, id: EventId) -> anyhow::Result<()> {
    let event = db.get_event(id).await?;
    println!("ID:          {}", event.id);
    println!("Message ID:  {}", event.message_id);
    println!("Type:        {}", event.event_type);
    println!("Search Key:  {}", event.search_key);
    println!("Released:    {}", event.released);
    println!(
        "Compose:     {}",
        event.compose_id.map_or("-".to_string(), |c| c.to_string())
    );
    println!("Created:     {}", event.created_at);
    println!("Updated:     {}", event.updated_at);
    println!("---");
    print_builds(&db.builds_for_event(id).await?);
    Ok(())
}

async fn cmd_build_list(db: &Db, filter: &BuildFilter) -> anyhow::Result<()> {
    let builds = db.list_builds(filter).await?;
    print_builds(&builds);
    Ok(())
}

fn print_builds(builds: &[ArtifactBuild]) {
    if builds.is_empty() {
        println!("No builds found.");
        return;
    }
    println!(
        "{:<6}  {:<6}  {:<30}  {:<8}  {:<6}  {:<10}  REASON",
        "ID", "EVENT", "NAME", "STATE", "DEP_ON", "TASK"
    );
    println!("{}", "-".repeat(100));
    for b in builds {
        let name = if b.name.len() > 30 { &b.name[..30] } else { &b.name };
        println!(
            "{:<6}  {:<6}  {:<30}  {:<8}  {:<6}  {:<10}  {}",
            b.id,
            b.event_id,
            name,
            b.state,
            b.dep_on.map_or("-".to_string(), |d| d.to_string()),
            b.build_id.map_or("-".to_string(), |t| t.to_string()),
            b.state_reason.as_deref().unwrap_or("")
        );
    }
    println!("\n{} build(s)", builds.len());
}

fn cmd_rules_check(
    options: &Options,
    handler: &str,
    artifact_type: &str,
    attrs: Option<&str>,
) -> anyhow::Result<()> {
    let rules = options.rules()?;
    let Some(attrs) = attrs else {
        println!("Rules OK.");
        return Ok(());
    };
    let artifact_type: ArtifactType = artifact_type.parse()?;
    let attrs: Attributes = serde_json::from_str(attrs)?;
    let decision = rules.decide(handler, artifact_type, &attrs);
    println!("{handler} / {artifact_type}: {decision}");
    if !decision.is_allowed() {
        std::process::exit(1);
    }
    Ok(())
}
