//! Command handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use directories::ProjectDirs;
use tracing::{info, warn};

use quote_core::{BroadcastEvent, ConflictInfo, LineItem, Quotation, ResolutionStrategy};
use quote_store::{EntityCache, PersistentStore, SqliteBackend, SqliteConfig};
use quote_sync::session::ALL_ENTITIES;
use quote_sync::{
    ConflictResolver, DocumentServer, HttpRemote, InMemoryRemote, PullOutcome, PushOutcome, RelayServer,
    RemoteDocuments, SessionStatus, SyncConfig, SyncError, SyncEventEmitter, SyncSession,
};

use crate::{EditArgs, DEFAULT_SERVER_URL};

/// How often `watch` checks that the server is reachable.
const PING_INTERVAL: Duration = Duration::from_secs(10);

// =============================================================================
// Context
// =============================================================================

/// Resolved configuration shared by all commands.
pub struct Context {
    config: SyncConfig,
    database: PathBuf,
}

impl Context {
    /// Loads the config file and applies command-line overrides.
    pub fn new(
        config_path: Option<PathBuf>,
        database: Option<PathBuf>,
        server: Option<String>,
        relay: Option<String>,
        session: Option<String>,
    ) -> Result<Self> {
        let mut config = SyncConfig::load(config_path).context("Failed to load sync configuration")?;

        if let Some(server) = server {
            config.sync.server_url = Some(server);
        }
        config
            .sync
            .server_url
            .get_or_insert_with(|| DEFAULT_SERVER_URL.to_string());
        if let Some(relay) = relay {
            config.bus.relay_url = Some(relay);
        }
        if let Some(session) = session {
            config.session.session_id = session;
        }
        config.validate()?;

        let database = match database.or_else(|| config.storage.database_path.clone()) {
            Some(path) => path,
            None => default_database_path()?,
        };

        Ok(Context { config, database })
    }

    /// Opens the shared SQLite cache.
    async fn cache(&self) -> Result<EntityCache<Quotation>> {
        let mut sqlite = SqliteConfig::new(self.database.clone());
        if let Some(quota) = self.config.storage.quota_bytes {
            sqlite = sqlite.quota_bytes(quota);
        }
        let backend = SqliteBackend::connect(sqlite)
            .await
            .with_context(|| format!("Failed to open cache at {}", self.database.display()))?;

        let store = PersistentStore::new(Arc::new(backend), self.config.namespace());
        Ok(EntityCache::new(store))
    }

    fn remote(&self) -> Result<HttpRemote<Quotation>> {
        let url = self.config.server_url().unwrap_or(DEFAULT_SERVER_URL);
        Ok(HttpRemote::new(url, self.config.request_timeout())?)
    }

    /// Builds and starts a session without an editor.
    async fn session(&self) -> Result<SyncSession<Quotation>> {
        let mut session = SyncSession::builder(self.config.clone())
            .with_cache(self.cache().await?)
            .with_remote(Arc::new(self.remote()?))
            .build()?;
        session.start().await?;
        Ok(session)
    }
}

/// Platform data directory, e.g. `~/.local/share/quote-sync/cache.db`.
fn default_database_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "quote", "quote-sync").context("Could not determine app data directory")?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("cache.db"))
}

// =============================================================================
// Infrastructure
// =============================================================================

pub async fn relay(ctx: &Context, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| ctx.config.bus.bind_address());
    let handle = RelayServer::new(bind, ctx.config.bus.channel_capacity).start().await?;
    println!("Relay listening on {}", handle.ws_url());

    shutdown_signal().await;
    handle.shutdown().await?;
    Ok(())
}

pub async fn serve(bind: String) -> Result<()> {
    let handle = DocumentServer::new(InMemoryRemote::<Quotation>::new(), bind)
        .start()
        .await?;
    println!("Serving quotations at {}/{}/{{id}}", handle.base_url(), <Quotation as quote_core::SyncDocument>::ENTITY_TYPE);

    shutdown_signal().await;
    handle.shutdown().await?;
    Ok(())
}

// =============================================================================
// Documents
// =============================================================================

pub async fn edit(ctx: &Context, args: EditArgs) -> Result<()> {
    let cache = ctx.cache().await?;
    let remote = ctx.remote()?;

    let mut doc = match &args.id {
        Some(id) => load(&cache, &remote, id).await?,
        None => {
            let Some(number) = args.number.clone() else {
                bail!("A new quotation needs --number");
            };
            Quotation::new(
                number,
                args.title.clone().unwrap_or_default(),
                args.customer.clone().unwrap_or_default(),
            )
        }
    };
    let items = args
        .items
        .iter()
        .map(|raw| parse_item(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut session = SyncSession::builder(ctx.config.clone())
        .with_cache(cache)
        .with_remote(Arc::new(remote))
        .with_editor(doc.clone())
        .build()?;
    session.start().await?;

    apply_edits(&mut doc, &args, items);
    if let Some(editor) = session.editor() {
        editor.send_replace(doc.clone());
    }

    let result = if args.no_push {
        match session.on_teardown().await {
            quote_sync::SaveOutcome::Failed => Err(anyhow::anyhow!("Local cache write failed")),
            outcome => {
                println!("{} {:?}", doc.id, outcome);
                Ok(())
            }
        }
    } else {
        report_push(&doc.id, session.save_now().await)
    };

    print_quotation(&doc);
    session.shutdown().await?;
    result
}

pub async fn pull(ctx: &Context, id: &str) -> Result<()> {
    let mut session = ctx.session().await?;
    let outcome = session.pull(id).await;

    match &outcome {
        PullOutcome::Updated(server) => println!("{} pulled at version {}", id, server.version_number),
        PullOutcome::LocalChangesPending(_) => println!("{} has local changes; cache left as is", id),
        PullOutcome::Offline(_) => println!("Offline; showing cached copy"),
        PullOutcome::NotFound(_) => println!("{} is not on the server", id),
        PullOutcome::Failed { error, .. } => warn!(%error, "Pull failed"),
    }
    if let Some(doc) = outcome.data() {
        print_quotation(doc);
    }

    session.shutdown().await?;
    match outcome {
        PullOutcome::Failed { error, .. } => bail!("Pull failed: {}", error),
        _ => Ok(()),
    }
}

pub async fn push(ctx: &Context, id: &str, strategy: Option<ResolutionStrategy>) -> Result<()> {
    let mut session = ctx.session().await?;
    let resolver = strategy.as_ref().map(|s| s as &dyn ConflictResolver);
    let outcome = session.push(id, resolver).await;
    session.shutdown().await?;
    report_push(id, outcome)
}

pub async fn sync_all(ctx: &Context, strategy: Option<ResolutionStrategy>) -> Result<()> {
    let mut session = ctx.session().await?;
    let report = match strategy {
        Some(strategy) => session.coordinator().sync_all_dirty(Some(&strategy)).await,
        None => session.sync_all().await,
    };
    session.shutdown().await?;

    if report.is_empty() {
        println!("Nothing to sync");
        return Ok(());
    }
    for (id, outcome) in &report.outcomes {
        println!("{:<38} {}", id, outcome);
    }
    println!(
        "{} synced, {} conflicts, {} failed",
        report.succeeded(),
        report.conflicts(),
        report.failed()
    );

    if report.failed() > 0 {
        bail!("{} quotation(s) failed to sync", report.failed());
    }
    Ok(())
}

pub async fn status(ctx: &Context, id: Option<String>, json: bool) -> Result<()> {
    let cache = ctx.cache().await?;
    let ids = match id {
        Some(id) => vec![id],
        None => cache.list_ids().await,
    };

    for id in ids {
        let Some(cached) = cache.get_with_meta(&id).await else {
            println!("{:<38} not cached", id);
            continue;
        };
        if json {
            println!("{}", serde_json::to_string_pretty(&cached)?);
            continue;
        }
        let meta = &cached.metadata;
        println!(
            "{:<38} {:<9} v{:<4} {} {}{}",
            id,
            meta.sync_status.as_str(),
            meta.server_version,
            if meta.is_dirty { "dirty" } else { "clean" },
            cached.data.title,
            meta.last_error
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn clear(ctx: &Context, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear the cache without --yes; unsynced edits would be lost");
    }
    let removed = ctx.cache().await?.clear().await;
    info!(removed, "Cache cleared");
    println!("Removed {} cached quotation(s)", removed);
    Ok(())
}

pub async fn watch(ctx: &Context, request_state: bool) -> Result<()> {
    let mut session = SyncSession::builder(ctx.config.clone())
        .with_cache(ctx.cache().await?)
        .with_remote(Arc::new(ctx.remote()?))
        .with_emitter(Arc::new(ConsoleEmitter))
        .with_connectivity_ping(PING_INTERVAL)
        .build()?;
    session.start().await?;

    if !session.bus().is_ready() {
        warn!("Broadcast bus unavailable; only local status is shown");
    }
    if request_state && !session.request_state(ALL_ENTITIES).await {
        warn!("Could not send state request");
    }
    println!("Watching session '{}' as {}", ctx.config.session.session_id, session.bus().origin_id());

    shutdown_signal().await;
    session.shutdown().await?;
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// Reads a quotation from the cache, fetching it from the server if absent.
async fn load(cache: &EntityCache<Quotation>, remote: &HttpRemote<Quotation>, id: &str) -> Result<Quotation> {
    if let Some(doc) = cache.get(id).await {
        return Ok(doc);
    }
    match remote.fetch(id).await {
        Ok(server) => {
            cache.save_server_copy(&server).await;
            Ok(server.data)
        }
        Err(SyncError::NotFound { .. }) => bail!("Quotation {} is neither cached nor on the server", id),
        Err(e) => Err(e).with_context(|| format!("Failed to fetch {}", id)),
    }
}

fn apply_edits(doc: &mut Quotation, args: &EditArgs, items: Vec<LineItem>) {
    if let Some(number) = &args.number {
        doc.number = number.clone();
    }
    if let Some(title) = &args.title {
        doc.title = title.clone();
    }
    if let Some(customer) = &args.customer {
        doc.customer_name = customer.clone();
    }
    if let Some(currency) = &args.currency {
        doc.currency = currency.to_uppercase();
    }
    if let Some(notes) = &args.notes {
        doc.notes = Some(notes.clone()).filter(|n| !n.is_empty());
    }
    if let Some(bps) = args.discount_bps {
        doc.discount_bps = bps;
    }
    doc.line_items.extend(items);
}

/// Parses `DESCRIPTION:QUANTITY:UNIT_PRICE_CENTS`; the description may
/// itself contain colons.
fn parse_item(raw: &str) -> Result<LineItem> {
    let mut parts = raw.rsplitn(3, ':');
    let (Some(price), Some(quantity), Some(description)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("Invalid item '{}'; expected DESCRIPTION:QUANTITY:UNIT_PRICE_CENTS", raw);
    };
    let quantity = quantity
        .trim()
        .parse::<i64>()
        .with_context(|| format!("Invalid quantity in '{}'", raw))?;
    let price = price
        .trim()
        .parse::<i64>()
        .with_context(|| format!("Invalid price in '{}'", raw))?;
    Ok(LineItem::new(description.trim(), quantity, price))
}

fn report_push(id: &str, outcome: PushOutcome) -> Result<()> {
    match outcome {
        PushOutcome::Conflict(info) => {
            print_conflict(&info);
            println!("Re-run with --strategy keep-local|keep-server|merge|cancel");
            Ok(())
        }
        PushOutcome::Failed(error) => bail!("Push of {} failed: {}", id, error),
        outcome => {
            println!("{} {}", id, outcome);
            Ok(())
        }
    }
}

fn print_conflict(info: &ConflictInfo) {
    println!(
        "{} conflict: server at v{}, local copy based on v{}; differing fields: {}",
        info.entity_id,
        info.server_version,
        info.local_version,
        info.conflicting_fields.join(", ")
    );
}

fn print_quotation(doc: &Quotation) {
    println!("  id:       {}", doc.id);
    println!("  number:   {}", doc.number);
    println!("  title:    {}", doc.title);
    println!("  customer: {}", doc.customer_name);
    for item in &doc.line_items {
        println!(
            "    {:>4} x {:<30} {:>10}",
            item.quantity,
            item.description,
            format_cents(item.line_total_cents())
        );
    }
    println!("  total:    {} {}", format_cents(doc.total_cents()), doc.currency);
}

fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, cents / 100, cents % 100)
}

/// Prints session events as they happen.
struct ConsoleEmitter;

impl SyncEventEmitter for ConsoleEmitter {
    fn emit_status(&self, status: &SessionStatus) {
        tracing::debug!(
            online = status.online,
            bus_ready = status.bus_ready,
            dirty = status.dirty_count,
            "Session status"
        );
    }

    fn emit_conflict(&self, conflict: &ConflictInfo) {
        print_conflict(conflict);
    }

    fn emit_remote_change(&self, event: &BroadcastEvent) {
        println!("{:<18} {:<38} from {}", event.kind.to_string(), event.entity_id, event.origin_id);
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        eprintln!("error{}: {}", if retryable { " (will retry)" } else { "" }, message);
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_item() {
        let item = parse_item("Labour: day rate:2:45000").unwrap();
        assert_eq!(item.description, "Labour: day rate");
        assert_eq!(item.quantity, 2);
        assert_eq!(item.unit_price_cents, 45000);

        assert!(parse_item("no-fields").is_err());
        assert!(parse_item("Tiles:many:100").is_err());
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(12345), "123.45");
        assert_eq!(format_cents(-5), "-0.05");
    }
}
