mod config;
mod metrics;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use clap::{Parser, Subcommand};
use cidc_access::{AccessService, GrantRequest, ReconcileMode, RolePolicy};
use cidc_acl::BucketAcl;
use cidc_acl_gcs::GcsBucketAcl;
use cidc_acl_memory::MemoryBucket;
use cidc_audit::{AuditAction, AuditLog, AuditLogFilter};
use cidc_storage::{
    Ledger, NewDownloadableFile, NewUser, PermissionFilter, PermissionKey, Role, TrialId,
    UploadType, User, UserStatus,
};
use cidc_store_sqlite::SqliteLedger;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{AclBackend, ServerConfig};

// ────────────────────────────────────── CLI Types ──────────────────────────────────────

#[derive(Parser)]
#[command(name = "cidc-access-server")]
#[command(about = "Grant, revoke and reconcile access to the cidc data bucket")]
struct Cli {
    /// Ledger database URL (overrides DATABASE_URL from the environment config)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one reconciliation pass
    Reconcile {
        /// Also diff every user's store grants against the ledger
        #[arg(long)]
        full: bool,
    },
    /// Reconcile periodically and serve /healthz, /readyz and /metrics
    Watch {
        /// Health and metrics HTTP address
        #[arg(long, default_value = "0.0.0.0:8080")]
        health_addr: String,

        /// Seconds between passes (defaults to CIDC_RECONCILE_INTERVAL_SECS)
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Every Nth pass is a full pass that also disables inactive users
        #[arg(long, default_value = "12")]
        full_every: u64,
    },
    /// Disable approved users who have not been seen within the inactivity window
    DisableInactive,
    /// Create a user in pending state
    AddUser {
        email: String,
        #[arg(long)]
        organization: Option<String>,
    },
    /// Approve, disable, reactivate or change the role of a user
    SetStatus {
        email: String,
        /// pending, approved or disabled
        status: String,
        /// Role to hold after the change (defaults to the current role)
        #[arg(long)]
        role: Option<String>,
        /// Acting administrator's email
        #[arg(long)]
        by: Option<String>,
    },
    /// Grant a permission; `*` is accepted for trial or upload type
    Grant {
        email: String,
        trial: String,
        upload_type: String,
        /// Expire the grant after this many hours
        #[arg(long)]
        expires_hours: Option<i64>,
        #[arg(long)]
        by: Option<String>,
    },
    /// Revoke a permission
    Revoke {
        email: String,
        trial: String,
        upload_type: String,
        #[arg(long)]
        by: Option<String>,
    },
    /// List permissions, optionally for one user
    Permissions {
        email: Option<String>,
        /// Include revoked and expired rows
        #[arg(long)]
        all: bool,
    },
    /// List the files a user can see
    Files { email: String },
    /// List the users who can read a trial's upload type
    Access { trial: String, upload_type: String },
    /// Register a completed upload and grant the uploader access to it
    RegisterFile {
        trial: String,
        upload_type: String,
        object_url: String,
        #[arg(long, default_value = "0")]
        size: i64,
        #[arg(long)]
        md5: Option<String>,
        /// Uploader's email
        #[arg(long)]
        uploader: Option<String>,
    },
    /// Show recent audit events
    Audit {
        /// Only events about this user
        email: Option<String>,
        /// Only events performed by this administrator
        #[arg(long)]
        by: Option<String>,
        /// Action name, e.g. permission.grant or acl.fatal
        #[arg(long)]
        action: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

// ────────────────────────────────────── Wiring ──────────────────────────────────────

async fn open_ledger(url: &str) -> Result<SqliteLedger, Box<dyn Error>> {
    if url.contains(":memory:") {
        Ok(SqliteLedger::open_in_memory().await?)
    } else {
        Ok(SqliteLedger::open(url).await?)
    }
}

async fn build_service(
    config: &ServerConfig,
) -> Result<(AccessService, Arc<SqliteLedger>), Box<dyn Error>> {
    let ledger = Arc::new(open_ledger(&config.database_url).await?);
    let acl: Arc<dyn BucketAcl> = match &config.acl {
        AclBackend::Gcs(gcs) => Arc::new(GcsBucketAcl::new(gcs.clone())?),
        AclBackend::Memory => {
            warn!("using the in-memory ACL backend; no object store changes will be made");
            Arc::new(MemoryBucket::new())
        }
    };
    let policy = match &config.role_policy_path {
        Some(path) => RolePolicy::from_path(path)?,
        None => RolePolicy::default(),
    };

    let service = AccessService::builder(ledger.clone(), acl)
        .policy(policy)
        .audit_log(ledger.clone())
        .config(config.access.clone())
        .build();
    Ok((service, ledger))
}

async fn user_by_email(service: &AccessService, email: &str) -> Result<User, Box<dyn Error>> {
    service
        .ledger()
        .get_user_by_email(email)
        .await
        .map_err(|e| format!("user {}: {}", email, e).into())
}

async fn actor_id(
    service: &AccessService,
    email: Option<&str>,
) -> Result<Option<cidc_storage::UserId>, Box<dyn Error>> {
    match email {
        Some(email) => Ok(Some(user_by_email(service, email).await?.id)),
        None => Ok(None),
    }
}

// ────────────────────────────────────── CLI Commands ──────────────────────────────────────

async fn cmd_reconcile(service: &AccessService, full: bool) -> Result<(), Box<dyn Error>> {
    let mode = if full {
        ReconcileMode::Full
    } else {
        ReconcileMode::Incremental
    };
    let report = service.reconcile(mode).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_disable_inactive(service: &AccessService) -> Result<(), Box<dyn Error>> {
    let disabled = service.disable_inactive_users().await?;
    if disabled.is_empty() {
        println!("No inactive users.");
    } else {
        for email in disabled {
            println!("✓ Disabled {}", email);
        }
    }
    Ok(())
}

async fn cmd_add_user(
    service: &AccessService,
    email: &str,
    organization: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let user = service
        .ledger()
        .upsert_user(
            &NewUser {
                email: email.to_string(),
                organization,
            },
            Utc::now(),
        )
        .await?;
    println!("✓ {} ({}) is {}", user.email, user.id, user.status);
    Ok(())
}

async fn cmd_set_status(
    service: &AccessService,
    email: &str,
    status: &str,
    role: Option<&str>,
    by: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let user = user_by_email(service, email).await?;
    let new: UserStatus = status.parse()?;
    let role: Option<Role> = match role {
        Some(role) => Some(role.parse()?),
        None => user.role,
    };
    let actor = actor_id(service, by).await?;

    let outcome = service
        .on_user_status_change(&user.id, user.status, new, role, actor.as_ref())
        .await?;
    println!("✓ {}: {:?}", user.email, outcome);
    Ok(())
}

async fn cmd_grant(
    service: &AccessService,
    email: &str,
    key: PermissionKey,
    expires_hours: Option<i64>,
    by: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let user = user_by_email(service, email).await?;
    let outcome = service
        .grant(GrantRequest {
            user_id: user.id,
            key,
            granted_by: actor_id(service, by).await?,
            expires_at: expires_hours.map(|h| Utc::now() + chrono::Duration::hours(h)),
        })
        .await?;

    let verb = if outcome.created {
        "Granted"
    } else {
        "Already granted"
    };
    println!("✓ {} {} to {}", verb, outcome.permission.key, email);
    println!("  store: {:?}", outcome.convergence);
    Ok(())
}

async fn cmd_revoke(
    service: &AccessService,
    email: &str,
    key: PermissionKey,
    by: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let user = user_by_email(service, email).await?;
    let actor = actor_id(service, by).await?;
    let outcome = service.revoke(&user.id, &key, actor.as_ref()).await?;
    match outcome.permission {
        Some(_) => println!("✓ Revoked {} from {}", key, email),
        None => println!("{} had no active grant for {}", email, key),
    }
    println!("  store: {:?}", outcome.convergence);
    Ok(())
}

async fn cmd_permissions(
    service: &AccessService,
    email: Option<&str>,
    all: bool,
) -> Result<(), Box<dyn Error>> {
    let user_id = match email {
        Some(email) => Some(user_by_email(service, email).await?.id),
        None => None,
    };
    let rows = service
        .list_permissions(&PermissionFilter {
            user_id,
            include_inactive: all,
            ..Default::default()
        })
        .await?;

    if rows.is_empty() {
        println!("No permissions found.");
        return Ok(());
    }
    for row in rows {
        let state = if row.active { "active" } else { "inactive" };
        println!(
            "{}  {}  user={}  source={}  acl={}  {}",
            row.id,
            row.key,
            row.user_id,
            row.source.as_str(),
            row.acl_state.as_str(),
            state
        );
    }
    Ok(())
}

async fn cmd_files(service: &AccessService, email: &str) -> Result<(), Box<dyn Error>> {
    let user = user_by_email(service, email).await?;
    let files = service.files_visible_to(&user.id).await?;
    if files.is_empty() {
        println!("{} can see no files.", email);
    }
    for file in files {
        println!(
            "{}  {}  {} bytes",
            file.object_url, file.upload_type, file.file_size_bytes
        );
    }
    Ok(())
}

async fn cmd_access(
    service: &AccessService,
    trial: &str,
    upload_type: &str,
) -> Result<(), Box<dyn Error>> {
    let users = service
        .users_with_access(&TrialId::new(trial), &UploadType::new(upload_type))
        .await?;
    if users.is_empty() {
        println!("Nobody can read {} on {}.", upload_type, trial);
    }
    for user in users {
        let role = user.role.map(|r| r.as_str()).unwrap_or("-");
        println!("{}  {}", user.email, role);
    }
    Ok(())
}

async fn cmd_register_file(
    service: &AccessService,
    file: NewDownloadableFile,
    uploader: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let uploader = actor_id(service, uploader).await?;
    let outcome = service.register_file(&file, uploader.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn cmd_audit(
    service: &AccessService,
    log: &dyn AuditLog,
    email: Option<&str>,
    by: Option<&str>,
    action: Option<&str>,
    limit: u32,
) -> Result<(), Box<dyn Error>> {
    let mut filter = match email {
        Some(email) => AuditLogFilter::for_subject(user_by_email(service, email).await?.id),
        None => AuditLogFilter::new(),
    };
    if let Some(actor) = actor_id(service, by).await? {
        filter = filter.actor(actor);
    }
    if let Some(action) = action {
        filter = filter.action(action.parse::<AuditAction>()?);
    }

    let events = log.query(filter.page(limit, 0)).await?;
    if events.is_empty() {
        println!("No audit events found.");
    }
    for event in events {
        println!(
            "{}  {}  {}:{}  {}",
            event.timestamp.to_rfc3339(),
            event.action,
            event.resource_type,
            event.resource_id,
            event.result
        );
        if let Some(reason) = event.reason {
            println!("  reason: {}", reason);
        }
    }
    Ok(())
}

// ────────────────────────────────────── Watch Loop ──────────────────────────────────────

#[derive(Clone)]
struct HealthState {
    ready: watch::Receiver<bool>,
    metrics: Option<PrometheusHandle>,
}

fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn readiness_handler(State(state): State<HealthState>) -> Result<&'static str, StatusCode> {
    if *state.ready.borrow() {
        Ok("ok")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn metrics_handler(State(state): State<HealthState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(StatusCode::NOT_FOUND)
}

fn mode_for_pass(pass: u64, full_every: u64) -> ReconcileMode {
    if full_every > 0 && pass % full_every == 0 {
        ReconcileMode::Full
    } else {
        ReconcileMode::Incremental
    }
}

async fn cmd_watch(
    service: &AccessService,
    health_addr: &str,
    interval: Duration,
    full_every: u64,
) -> Result<(), Box<dyn Error>> {
    let handle = metrics::init_metrics()?;
    let health_addr: SocketAddr = health_addr.parse()?;

    let (ready_tx, ready_rx) = watch::channel(false);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(health_addr).await?;
    info!(addr = %listener.local_addr()?, "health and metrics listening");
    let router = health_router(HealthState {
        ready: ready_rx,
        metrics: Some(handle),
    });
    let health_server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut pass: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mode = mode_for_pass(pass, full_every);
                pass += 1;
                match service.reconcile(mode).await {
                    Ok(_) => {
                        let _ = ready_tx.send(true);
                        metrics::set_ready(true);
                    }
                    // Already logged and audited; stay unready until a pass succeeds.
                    Err(e) if e.is_fatal() => {
                        let _ = ready_tx.send(false);
                        metrics::set_ready(false);
                    }
                    Err(e) => warn!(error = %e, "reconciliation pass failed; retrying next tick"),
                }
                if mode == ReconcileMode::Full {
                    match service.disable_inactive_users().await {
                        Ok(disabled) if !disabled.is_empty() => {
                            info!(count = disabled.len(), "disabled inactive users");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "disabling inactive users failed"),
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }

    let _ = ready_tx.send(false);
    let _ = stop_tx.send(true);
    health_server.await??;
    info!("watch loop stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for SIGINT");
    }
}

// ────────────────────────────────────── Main ──────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    let (service, ledger) = build_service(&config).await?;

    let result = run_command(cli.command, &service, &ledger, &config).await;
    service.shutdown().await;
    result
}

async fn run_command(
    command: Command,
    service: &AccessService,
    ledger: &SqliteLedger,
    config: &ServerConfig,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Reconcile { full } => cmd_reconcile(service, full).await?,
        Command::Watch {
            health_addr,
            interval_secs,
            full_every,
        } => {
            let interval = interval_secs
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(config.reconcile_interval);
            cmd_watch(service, &health_addr, interval, full_every).await?;
        }
        Command::DisableInactive => cmd_disable_inactive(service).await?,
        Command::AddUser {
            email,
            organization,
        } => cmd_add_user(service, &email, organization).await?,
        Command::SetStatus {
            email,
            status,
            role,
            by,
        } => cmd_set_status(service, &email, &status, role.as_deref(), by.as_deref()).await?,
        Command::Grant {
            email,
            trial,
            upload_type,
            expires_hours,
            by,
        } => {
            let key = PermissionKey::from_db(&trial, &upload_type);
            cmd_grant(service, &email, key, expires_hours, by.as_deref()).await?;
        }
        Command::Revoke {
            email,
            trial,
            upload_type,
            by,
        } => {
            let key = PermissionKey::from_db(&trial, &upload_type);
            cmd_revoke(service, &email, key, by.as_deref()).await?;
        }
        Command::Permissions { email, all } => {
            cmd_permissions(service, email.as_deref(), all).await?
        }
        Command::Files { email } => cmd_files(service, &email).await?,
        Command::Access { trial, upload_type } => {
            cmd_access(service, &trial, &upload_type).await?
        }
        Command::RegisterFile {
            trial,
            upload_type,
            object_url,
            size,
            md5,
            uploader,
        } => {
            let upload_type = UploadType::new(upload_type);
            let file = NewDownloadableFile {
                trial_id: TrialId::new(trial),
                facet_group: format!("/{}", upload_type),
                upload_type,
                object_url,
                md5_hash: md5,
                file_size_bytes: size,
            };
            cmd_register_file(service, file, uploader.as_deref()).await?;
        }
        Command::Audit {
            email,
            by,
            action,
            limit,
        } => {
            cmd_audit(
                service,
                ledger,
                email.as_deref(),
                by.as_deref(),
                action.as_deref(),
                limit,
            )
            .await?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn memory_config() -> ServerConfig {
        ServerConfig::from_lookup(|key| match key {
            "CIDC_ACL_BACKEND" => Some("memory".to_string()),
            "DATABASE_URL" => Some("sqlite::memory:".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_every_nth_pass_is_full() {
        assert_eq!(mode_for_pass(0, 3), ReconcileMode::Full);
        assert_eq!(mode_for_pass(1, 3), ReconcileMode::Incremental);
        assert_eq!(mode_for_pass(2, 3), ReconcileMode::Incremental);
        assert_eq!(mode_for_pass(3, 3), ReconcileMode::Full);
        assert_eq!(mode_for_pass(0, 0), ReconcileMode::Incremental);
    }

    #[tokio::test]
    async fn test_commands_against_memory_backends() {
        let (service, ledger) = build_service(&memory_config()).await.unwrap();

        cmd_add_user(&service, "a@example.org", None).await.unwrap();
        cmd_set_status(
            &service,
            "a@example.org",
            "approved",
            Some("cimac-user"),
            None,
        )
        .await
        .unwrap();
        cmd_register_file(
            &service,
            NewDownloadableFile {
                trial_id: TrialId::new("t1"),
                upload_type: UploadType::new("wes_bam"),
                object_url: "t1/wes_bam/a.bam".to_string(),
                md5_hash: None,
                file_size_bytes: 10,
                facet_group: "/wes_bam".to_string(),
            },
            None,
        )
        .await
        .unwrap();
        cmd_grant(
            &service,
            "a@example.org",
            PermissionKey::from_db("t1", "*"),
            None,
            None,
        )
        .await
        .unwrap();

        let user = user_by_email(&service, "a@example.org").await.unwrap();
        assert_eq!(service.files_visible_to(&user.id).await.unwrap().len(), 1);

        cmd_reconcile(&service, true).await.unwrap();
        cmd_revoke(
            &service,
            "a@example.org",
            PermissionKey::from_db("t1", "*"),
            None,
        )
        .await
        .unwrap();
        assert!(service.files_visible_to(&user.id).await.unwrap().is_empty());

        assert!(cmd_files(&service, "nobody@example.org").await.is_err());

        let grants = ledger
            .count(AuditLogFilter::for_subject(user.id.clone()).action(AuditAction::PermissionGrant))
            .await
            .unwrap();
        assert_eq!(grants, 1);
        cmd_audit(
            &service,
            ledger.as_ref(),
            Some("a@example.org"),
            None,
            Some("permission.revoke"),
            10,
        )
        .await
        .unwrap();
        assert!(cmd_audit(&service, ledger.as_ref(), None, None, Some("secret.read"), 10)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_role_policy_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roles.json");
        std::fs::write(
            &path,
            r#"{"version": 2, "roles": {"cimac-user": {"store_access": true}}}"#,
        )
        .unwrap();

        let mut config = memory_config();
        config.role_policy_path = Some(path);
        let (service, _) = build_service(&config).await.unwrap();
        assert_eq!(service.policy().version, 2);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (ready_tx, ready_rx) = watch::channel(false);
        let app = health_router(HealthState {
            ready: ready_rx,
            metrics: None,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let healthz_url = format!("http://{}/healthz", addr);
        let mut response = None;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Ok(r) = reqwest::get(&healthz_url).await {
                response = Some(r);
                break;
            }
        }
        let response = response.expect("health server did not start");
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");

        let readyz_url = format!("http://{}/readyz", addr);
        let response = reqwest::get(&readyz_url).await.unwrap();
        assert_eq!(response.status(), 503);

        ready_tx.send(true).unwrap();
        let response = reqwest::get(&readyz_url).await.unwrap();
        assert_eq!(response.status(), 200);

        let response = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }
}
