//! CLI harness for exercising the session lifecycle
//!
//! This tool allows testing:
//! - Setup, unlock, lock and reset of an instance
//! - Password rotation
//! - Queries against the unlocked datastore
//! - The full lifecycle scenario, including persisted-session restore and
//!   an instance switch
//!
//! The harness uses the in-process software keystore, so a persisted session
//! only survives within a single invocation (see `scenario`).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lockbox_session::{
    InstanceId, KdfParams, MockKeystore, PasswordStrength, SessionConfig, SessionManager,
    SessionRegistry, SetupOutcome,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "session-harness")]
#[command(about = "Lockbox session lifecycle harness", long_about = None)]
struct Cli {
    /// Data directory (defaults to the platform data dir or LOCKBOX_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Instance to operate on
    #[arg(short, long, global = true, default_value = "default")]
    instance: String,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use cheap KDF parameters for new credentials (testing only)
    #[arg(long, global = true)]
    fast_kdf: bool,

    /// Simulate a platform with a fingerprint sensor
    #[arg(long, global = true)]
    biometrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the state of an instance
    Status,

    /// Create the credential of an instance
    Setup {
        /// New password
        #[arg(short, long)]
        password: String,
    },

    /// Unlock an instance
    Unlock {
        /// Password
        #[arg(short, long)]
        password: String,

        /// Also persist the session
        #[arg(long)]
        persist: bool,
    },

    /// Rotate the password of an instance
    ChangePassword {
        /// Current password
        #[arg(long)]
        old: String,

        /// New password
        #[arg(long)]
        new: String,
    },

    /// Delete credential, persisted session and datastore of an instance
    Reset,

    /// Unlock and run one SQL statement
    Query {
        /// Password
        #[arg(short, long)]
        password: String,

        /// Statement to run
        #[arg(long)]
        sql: String,
    },

    /// Run the full lifecycle scenario on two scratch instances
    Scenario,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let keystore = Arc::new(if cli.biometrics {
        MockKeystore::with_biometrics()
    } else {
        MockKeystore::new()
    });
    let registry = SessionRegistry::new(config, keystore)?;
    info!("Data dir: {}", registry.config().data_dir.display());

    match cli.command {
        Commands::Scenario => run_scenario(&registry).await,
        command => {
            let instance: InstanceId = cli.instance.parse()?;
            let manager = registry.switch_instance(instance).await?;
            run_command(&manager, command).await?;
            print_state(&manager);
            Ok(())
        }
    }
}

async fn run_command(manager: &SessionManager, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Status | Commands::Scenario => {}
        Commands::Setup { password } => {
            let strength = PasswordStrength::evaluate(&password);
            if matches!(strength, PasswordStrength::Weak | PasswordStrength::Fair) {
                warn!("Password strength: {:?}", strength);
            }
            match manager.setup(&password).await? {
                SetupOutcome::Created => info!("Instance {} set up", manager.instance_id()),
                SetupOutcome::AlreadySetUp => {
                    warn!("Instance {} is already set up", manager.instance_id())
                }
            }
        }
        Commands::Unlock { password, persist } => {
            require_unlock(manager, &password, persist).await?;
        }
        Commands::ChangePassword { old, new } => {
            require_unlock(manager, &old, false).await?;
            if !manager.change_password(&old, &new).await? {
                bail!("Current password rejected");
            }
            info!("Password changed");
        }
        Commands::Reset => manager.reset().await?,
        Commands::Query { password, sql } => {
            require_unlock(manager, &password, false).await?;
            let result = manager.execute(&sql, &[]).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::from_env()?,
    };

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if cli.fast_kdf {
        warn!("Using insecure KDF parameters");
        config.kdf = KdfParams::insecure_for_tests();
    }
    config.validate()?;
    Ok(config)
}

async fn require_unlock(
    manager: &SessionManager,
    password: &str,
    persist: bool,
) -> anyhow::Result<()> {
    if !manager.unlock(password, persist).await? {
        bail!("Unlock of {} failed", manager.instance_id());
    }
    Ok(())
}

fn print_state(manager: &SessionManager) {
    let state = manager.state();
    info!(
        "{}: set_up={} unlocked={} persisted_session={}",
        manager.instance_id(),
        state.is_set_up,
        state.is_unlocked,
        state.has_persisted_session
    );

    let biometrics = manager.biometric_capability();
    info!(
        "{}: biometrics={} available={} locked_out={}",
        manager.instance_id(),
        biometrics.kind.label(),
        biometrics.available,
        biometrics.locked_out
    );
}

fn check(condition: bool, what: &str) -> anyhow::Result<()> {
    if !condition {
        bail!("Scenario step failed: {}", what);
    }
    info!("✅ {}", what);
    Ok(())
}

async fn run_scenario(registry: &SessionRegistry) -> anyhow::Result<()> {
    let primary: InstanceId = "scenario-primary".parse()?;
    let secondary: InstanceId = "scenario-secondary".parse()?;

    let switches = Arc::new(AtomicUsize::new(0));
    let counter = switches.clone();
    let _subscription = registry.on_instance_change(move |change| {
        counter.fetch_add(1, Ordering::SeqCst);
        info!(
            "Instance change: {:?} -> {}",
            change.previous.as_ref().map(InstanceId::as_str),
            change.current
        );
    });

    // Scratch instances start from nothing
    for id in [&primary, &secondary] {
        registry.manager(id).reset().await?;
    }

    let manager = registry.switch_instance(primary.clone()).await?;
    manager.setup("testpassword123").await?;
    check(
        manager.unlock("testpassword123", false).await?,
        "unlock with setup password",
    )?;
    let state = manager.state();
    check(state.is_set_up && state.is_unlocked, "set up and unlocked")?;

    manager.execute("CREATE TABLE notes (body TEXT)", &[]).await?;
    manager
        .execute("INSERT INTO notes (body) VALUES ('scenario')", &[])
        .await?;

    check(
        manager.change_password("testpassword123", "newpassword123").await?,
        "password changed",
    )?;
    manager.lock(false).await?;
    check(
        !manager.unlock("testpassword123", false).await?,
        "old password rejected",
    )?;
    check(
        manager.unlock("newpassword123", true).await?,
        "new password accepted and session persisted",
    )?;

    manager.lock(false).await?;
    check(manager.restore_session().await?, "persisted session restored")?;
    let rows = manager.execute("SELECT body FROM notes", &[]).await?;
    check(rows.rows.len() == 1, "datastore readable after rotation")?;

    let other = registry.switch_instance(secondary.clone()).await?;
    other.setup("testpassword123").await?;
    check(
        !other.unlock("wrongpass", false).await?,
        "wrong password rejected on fresh instance",
    )?;
    check(
        !registry.manager(&primary).state().is_unlocked,
        "previous instance locked on switch",
    )?;

    manager.lock(true).await?;
    check(
        !manager.restore_session().await?,
        "cleared session cannot be restored",
    )?;

    manager.reset().await?;
    let state = manager.state();
    check(
        !state.is_set_up && !state.is_unlocked && !state.has_persisted_session,
        "reset",
    )?;

    check(
        switches.load(Ordering::SeqCst) == 2,
        "one notification per switch",
    )?;
    other.reset().await?;

    info!("Scenario complete");
    Ok(())
}
