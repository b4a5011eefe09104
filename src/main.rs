//! flowgate - declarative process engine
//!
//! Runs a locker process and an invoice process against in-memory stores and
//! prints the domain event stream as JSON lines.

use flowgate_core::{
    BlockingPoolExecutor, Caller, Command, CommandRegistry, Context, Engine, EngineConfig,
    EngineError, Entity, EventKind, ExecutorMode, InlineExecutor, MemoryEntityStore,
    MemoryLockStore, Process, ProcessDefinition, ProcessManager, SideEffectExecutor, Transition,
    TransitionEvent,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

flowgate_core::process_actions! {
    trait LockerActions { lock, unlock }
}

const INVOICE_PROCESS: &str = include_str!("../demos/invoice.json");

const CARD_LIMIT: f64 = 1000.0;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if FLOWGATE_CONFIG is set, then env overrides)
    let config = match EngineConfig::load() {
        Ok(c) => c,
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("FLOWGATE_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            EngineConfig::default()
        }
    };

    tracing::info!("Starting flowgate demo");
    tracing::info!("  Lock TTL: {}s", config.locks.ttl_secs);
    tracing::info!("  Executor: {:?}", config.executor.mode);

    let executor: Arc<dyn SideEffectExecutor> = match config.executor.mode {
        ExecutorMode::Inline => Arc::new(InlineExecutor),
        ExecutorMode::BlockingPool => Arc::new(BlockingPoolExecutor::current()?),
    };

    let entities = Arc::new(MemoryEntityStore::new());
    let locks = Arc::new(MemoryLockStore::new());
    let engine = Engine::builder(entities.clone(), locks)
        .config(config)
        .executor(executor)
        .build();
    let mut events = engine.subscribe();

    entities.insert(Entity::new("locker", "l-1").with_field("status", "open"));
    for (id, amount) in [("inv-1", 250), ("inv-2", 5000)] {
        entities.insert(
            Entity::new("invoice", id)
                .with_field("status", "draft")
                .with_field("is_available", true)
                .with_field("amount", amount),
        );
    }

    let manager = ProcessManager::new(engine.clone());
    manager.bind("locker", "status", locker_process()?);
    let invoice_process = ProcessDefinition::from_json(INVOICE_PROCESS)?.build(&registry())?;
    manager.bind("invoice", "status", invoice_process);

    // Locker: typed action methods. A bound process memoizes the entity, so
    // each step binds afresh once the previous one has settled.
    manager
        .process("locker", "l-1", "locker")?
        .lock(None, Context::new())?;
    settle(&mut events, "lock").await?;
    if let Err(e) = manager
        .process("locker", "l-1", "locker")?
        .lock(None, Context::new())
    {
        tracing::info!("Second lock refused: {}", e);
    }
    manager
        .process("locker", "l-1", "locker")?
        .unlock(None, Context::new())?;
    settle(&mut events, "unlock").await?;

    // Invoices: declarative process, callers with attributes
    let staff = Caller::new("u-staff").with_attribute("is_staff", true);
    let accountant = Caller::new("u-acct").with_attribute("is_accountant", true);

    for id in ["inv-1", "inv-2"] {
        for action in ["approve", "send"] {
            manager
                .process("invoice", id, "invoice")?
                .invoke(action, Some(&staff), Context::new())?;
            settle(&mut events, action).await?;
        }

        let invoice = manager.process("invoice", id, "invoice")?;
        tracing::info!(
            "{} actions for staff: {:?}, for accountant: {:?}",
            id,
            invoice.available_actions(Some(&staff))?,
            invoice.available_actions(Some(&accountant))?
        );

        invoice.invoke(
            "pay",
            Some(&accountant),
            Context::new().with("reference", format!("pay-{}", id)),
        )?;
        settle(&mut events, "pay").await?;

        tracing::info!("{} final state: {}", id, invoice.state().get_db_state()?);
    }

    Ok(())
}

fn locker_process() -> Result<Arc<Process>, EngineError> {
    Ok(Process::builder("locker")
        .transition(
            Transition::builder("lock")
                .source("open")
                .target("locked")
                .build()?,
        )
        .transition(
            Transition::builder("unlock")
                .source("locked")
                .target("open")
                .build()?,
        )
        .build())
}

fn registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry
        .register_command(Command::new("log_transition", |state, ctx| {
            tracing::info!(state = %state.key(), user = ?ctx.user().map(|u| &u.id), "transition committed");
            Ok(())
        }))
        .register_command(Command::new("send_email", |state, ctx| {
            state.set_field("emailed", true)?;
            ctx.insert("email_channel", "smtp");
            Ok(())
        }))
        .register_command(Command::new("charge_card", |state, ctx| {
            let entity = state.entity()?;
            let amount = entity
                .get("amount")
                .and_then(|v| v.as_f64())
                .unwrap_or_default();
            if amount > CARD_LIMIT {
                anyhow::bail!("amount {} exceeds card limit {}", amount, CARD_LIMIT);
            }
            state.set_field("charged", amount)?;
            if let Some(reference) = ctx.get("reference").cloned() {
                state.set_field("payment_reference", reference)?;
            }
            Ok(())
        }))
        .register_command(Command::new("notify_accounts", |state, ctx| {
            if let Some(failure) = ctx.error() {
                tracing::warn!(state = %state.key(), "payment failed: {}", failure);
            }
            Ok(())
        }));
    registry
}

/// Prints events until `action` completes or fails.
async fn settle(
    events: &mut broadcast::Receiver<TransitionEvent>,
    action: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let event = events.recv().await?;
        println!("{}", serde_json::to_string(&event)?);
        if event.action == action
            && matches!(event.kind, EventKind::Completed | EventKind::Failed { .. })
        {
            return Ok(());
        }
    }
}
